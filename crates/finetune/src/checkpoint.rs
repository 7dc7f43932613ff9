use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor, Var};
use safetensors::SafeTensors;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::TrainingError;

pub const POLICY_FILENAME: &str = "policy.pt";
pub const OPTIMIZER_FILENAME: &str = "optimizer.pt";
pub const SCHEDULER_FILENAME: &str = "scheduler.pt";
pub const LATEST_DIRNAME: &str = "LATEST";

const STEP_IDX_KEY: &str = "step_idx";
const METRICS_KEY: &str = "metrics";

/// Serialized state tagged with the example counter and the metrics current at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub step_idx: usize,
    pub state: T,
    pub metrics: BTreeMap<String, f64>,
}

/// Policy weights read back from a `policy.pt` envelope.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub step_idx: usize,
    pub metrics: BTreeMap<String, f64>,
    pub tensors: HashMap<String, Tensor>,
}

pub fn step_dirname(example_counter: usize) -> String {
    format!("step-{example_counter}")
}

pub fn ensure_dir(dir: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            dir.display()
        ))
    })
}

/// Writes the policy as safetensors with `step_idx` and `metrics` in the header metadata.
pub fn write_policy(
    path: &Path,
    step_idx: usize,
    tensors: &[(String, Tensor)],
    metrics: &BTreeMap<String, f64>,
) -> Result<PathBuf, TrainingError> {
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let metadata = HashMap::from([
        (STEP_IDX_KEY.to_string(), step_idx.to_string()),
        (METRICS_KEY.to_string(), serde_json::to_string(metrics)?),
    ]);
    let contiguous = tensors
        .iter()
        .map(|(name, tensor)| Ok((name.clone(), tensor.contiguous()?)))
        .collect::<Result<Vec<_>, TrainingError>>()?;
    safetensors::serialize_to_file(contiguous, &Some(metadata), path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize policy weights to {}: {err}",
            path.display()
        ))
    })?;
    Ok(path.to_path_buf())
}

pub fn read_policy(path: &Path, device: &Device) -> Result<PolicySnapshot, TrainingError> {
    let bytes = read_bytes(path)?;
    let (step_idx, metrics) = policy_header(&bytes, path)?;
    let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
    Ok(PolicySnapshot {
        step_idx,
        metrics,
        tensors,
    })
}

/// Copies a `policy.pt` envelope into `params`; names and shapes must match exactly.
pub fn load_policy_into(params: &[(String, Var)], path: &Path) -> Result<usize, TrainingError> {
    let Some((_, first)) = params.first() else {
        return Err(TrainingError::runtime("policy has no parameters to load"));
    };
    let device = first.as_tensor().device().clone();
    let snapshot = read_policy(path, &device)?;
    let mut by_name = snapshot.tensors;

    for (name, var) in params {
        let tensor = by_name.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, expected {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired)?
        };
        var.set(&tensor)?;
    }

    if !by_name.is_empty() {
        let mut extra = by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(snapshot.step_idx)
}

pub fn write_envelope<T: Serialize>(path: &Path, envelope: &Envelope<T>) -> Result<(), TrainingError> {
    write_json(path, envelope)
}

pub fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<Envelope<T>, TrainingError> {
    read_json(path)
}

/// `(step_idx, metrics)` of any envelope: safetensors policy files or JSON state files.
pub fn read_envelope_header(
    path: &Path,
) -> Result<(usize, BTreeMap<String, f64>), TrainingError> {
    let bytes = read_bytes(path)?;
    if SafeTensors::read_metadata(&bytes).is_ok() {
        return policy_header(&bytes, path);
    }

    #[derive(Deserialize)]
    struct Header {
        step_idx: usize,
        #[serde(default)]
        metrics: BTreeMap<String, f64>,
    }
    let header: Header = serde_json::from_slice(&bytes).map_err(|err| {
        TrainingError::runtime(format!("failed to parse envelope {}: {err}", path.display()))
    })?;
    Ok((header.step_idx, header.metrics))
}

fn policy_header(
    bytes: &[u8],
    path: &Path,
) -> Result<(usize, BTreeMap<String, f64>), TrainingError> {
    let (_, metadata) = SafeTensors::read_metadata(bytes).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read safetensors header {}: {err}",
            path.display()
        ))
    })?;
    let fields = metadata.metadata().as_ref().ok_or_else(|| {
        TrainingError::runtime(format!("{} carries no envelope metadata", path.display()))
    })?;
    let step_idx = fields
        .get(STEP_IDX_KEY)
        .and_then(|value| value.parse::<usize>().ok())
        .ok_or_else(|| {
            TrainingError::runtime(format!("{} has no valid step_idx", path.display()))
        })?;
    let metrics = match fields.get(METRICS_KEY) {
        Some(json) => serde_json::from_str(json)?,
        None => BTreeMap::new(),
    };
    Ok((step_idx, metrics))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, TrainingError> {
    fs::read(path)
        .map_err(|err| TrainingError::runtime(format!("failed to read {}: {err}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use tempfile::tempdir;

    use super::*;

    fn metrics() -> BTreeMap<String, f64> {
        BTreeMap::from([("loss/eval".to_string(), 1.25)])
    }

    #[test]
    fn policy_header_carries_step_and_metrics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(POLICY_FILENAME);
        let weight = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        write_policy(&path, 40, &[("w".to_string(), weight)], &metrics()).unwrap();

        let (step, logged) = read_envelope_header(&path).unwrap();
        assert_eq!(step, 40);
        assert_eq!(logged, metrics());

        let snapshot = read_policy(&path, &Device::Cpu).unwrap();
        assert_eq!(snapshot.tensors["w"].dims(), &[2, 3]);
    }

    #[test]
    fn json_envelope_header_matches_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SCHEDULER_FILENAME);
        let envelope = Envelope {
            step_idx: 12,
            state: vec![1u32, 2, 3],
            metrics: metrics(),
        };
        write_envelope(&path, &envelope).unwrap();

        assert_eq!(read_envelope_header(&path).unwrap(), (12, metrics()));
        let restored: Envelope<Vec<u32>> = read_envelope(&path).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn load_policy_rejects_missing_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(POLICY_FILENAME);
        let weight = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        write_policy(&path, 0, &[("a".to_string(), weight)], &BTreeMap::new()).unwrap();

        let a = Var::ones(4, DType::F32, &Device::Cpu).unwrap();
        let b = Var::ones(4, DType::F32, &Device::Cpu).unwrap();
        let params = vec![("a".to_string(), a.clone()), ("b".to_string(), b)];
        assert!(load_policy_into(&params, &path).is_err());

        let params = vec![("a".to_string(), a.clone())];
        assert_eq!(load_policy_into(&params, &path).unwrap(), 0);
        assert_eq!(a.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0; 4]);
    }
}
