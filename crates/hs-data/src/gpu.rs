use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;

use hs_types::{DataError, HsError, HsResult};
use serde::{Deserialize, Serialize};

/// Where a trial trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl Device {
    /// The candle device tensors for this trial should live on.
    pub fn to_candle(self) -> HsResult<candle_core::Device> {
        match self {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(idx) => candle_core::Device::new_cuda(idx).map_err(|e| {
                HsError::from(DataError::Tensor {
                    message: format!("could not open cuda:{idx}: {e}"),
                })
            }),
        }
    }
}

/// Parse `nvidia-smi --query-gpu=memory.free --format=csv,nounits,noheader`
/// output into device index -> free MiB.
pub fn parse_gpu_report(output: &str) -> HsResult<BTreeMap<usize, u64>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(idx, line)| {
            line.parse::<u64>().map(|free| (idx, free)).map_err(|e| {
                HsError::from(DataError::GpuQuery {
                    message: format!("unexpected nvidia-smi line {line:?}: {e}"),
                })
            })
        })
        .collect()
}

/// Free memory per GPU, as reported by `nvidia-smi`.
pub fn gpu_report() -> HsResult<BTreeMap<usize, u64>> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.free",
            "--format=csv,nounits,noheader",
        ])
        .output()
        .map_err(|e| DataError::GpuQuery {
            message: format!("could not run nvidia-smi: {e}"),
        })?;
    if !output.status.success() {
        return Err(DataError::GpuQuery {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    parse_gpu_report(&String::from_utf8_lossy(&output.stdout))
}

/// Device with the most free memory; ties go to the lowest index.
pub fn best_device(report: &BTreeMap<usize, u64>) -> Option<Device> {
    report
        .iter()
        .fold(None, |best: Option<(usize, u64)>, (&idx, &free)| match best {
            Some((_, best_free)) if best_free >= free => best,
            _ => Some((idx, free)),
        })
        .map(|(idx, _)| Device::Cuda(idx))
}

/// Pick the training device: CPU unless `use_gpu`, else the emptiest GPU.
pub fn select_device(use_gpu: bool) -> HsResult<Device> {
    if !use_gpu {
        return Ok(Device::Cpu);
    }
    let report = gpu_report()?;
    tracing::debug!("GPU free memory (MiB): {:?}", report);
    best_device(&report).ok_or_else(|| {
        HsError::from(DataError::GpuQuery {
            message: "nvidia-smi reported no devices".to_string(),
        })
    })
}
