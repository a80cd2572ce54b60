//! Forward-model bundle directories.
//!
//! ```text
//! <dir>/info.json            channel metadata
//! <dir>/leadfield.json       cached fixed-orientation leadfield (optional)
//! <dir>/fsaverage-fwd.json   forward model
//! ```

use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

use super::ForwardModel;
use crate::data::Info;
use crate::error::{EsinetError, EsinetResult};

pub const INFO_FILE: &str = "info.json";
pub const LEADFIELD_FILE: &str = "leadfield.json";
pub const FORWARD_FILE: &str = "fsaverage-fwd.json";

/// Read a JSON document from `path`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> EsinetResult<T> {
    let file = File::open(path).map_err(|e| EsinetError::io(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Write `value` to `path` as JSON, replacing any existing file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> EsinetResult<()> {
    let file = File::create(path).map_err(|e| EsinetError::io(path, e))?;
    serde_json::to_writer(BufWriter::new(file), value)?;
    Ok(())
}

pub fn load_info(dir: impl AsRef<Path>) -> EsinetResult<Info> {
    read_json(&dir.as_ref().join(INFO_FILE))
}

pub fn load_fwd(dir: impl AsRef<Path>) -> EsinetResult<ForwardModel> {
    let fwd: ForwardModel = read_json(&dir.as_ref().join(FORWARD_FILE))?;
    fwd.validate()?;
    Ok(fwd)
}

/// Load the fixed-orientation leadfield of a bundle.
///
/// Uses the cached leadfield when present, otherwise converts the forward model.
pub fn load_leadfield(dir: impl AsRef<Path>) -> EsinetResult<Array2<f64>> {
    let cached = dir.as_ref().join(LEADFIELD_FILE);
    if cached.is_file() {
        debug!(path = %cached.display(), "loading cached leadfield");
        return read_json(&cached);
    }
    Ok(load_fwd(dir)?.to_fixed().leadfield)
}

/// Write a bundle directory, creating it when needed.
///
/// The cached leadfield is the fixed-orientation form of `fwd`.
pub fn save_bundle(dir: impl AsRef<Path>, fwd: &ForwardModel, info: &Info) -> EsinetResult<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| EsinetError::io(dir, e))?;
    write_json(&dir.join(INFO_FILE), info)?;
    write_json(&dir.join(FORWARD_FILE), fwd)?;
    write_json(&dir.join(LEADFIELD_FILE), &fwd.to_fixed().leadfield)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::tests::tiny_forward;
    use crate::forward::Orientation;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("esinet-io-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_bundle_round_trip() {
        let dir = scratch_dir("bundle");
        let fwd = tiny_forward(Orientation::Free);
        let info = Info::eeg(fwd.ch_names.clone(), 100.0);
        save_bundle(&dir, &fwd, &info).expect("save");

        let loaded = load_fwd(&dir).expect("load fwd");
        assert_eq!(loaded.leadfield, fwd.leadfield);
        assert_eq!(load_info(&dir).expect("load info"), info);
        assert_eq!(load_leadfield(&dir).expect("leadfield").dim(), (3, 8));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_slice_round_trip() {
        let dir = scratch_dir("json");
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("values.json");
        let values = [0.5, -1.0, 2.0];
        write_json(&path, &values[..]).expect("write");
        let back: Vec<f64> = read_json(&path).expect("read");
        assert_eq!(back, values);
        assert!(read_json::<Vec<f64>>(&dir.join("missing.json")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_leadfield_without_cache() {
        let dir = scratch_dir("nocache");
        let fwd = tiny_forward(Orientation::Free);
        save_bundle(&dir, &fwd, &Info::eeg(fwd.ch_names.clone(), 100.0)).expect("save");
        fs::remove_file(dir.join(LEADFIELD_FILE)).expect("remove cache");
        assert_eq!(load_leadfield(&dir).expect("leadfield"), fwd.to_fixed().leadfield);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_bundle_reports_path() {
        let err = load_info(scratch_dir("missing")).expect_err("missing");
        assert!(err.to_string().contains(INFO_FILE));
    }
}
