//! Shared fixtures for unit tests.

/// A complete hyperparameter config for a three-parameter MLP sweep.
/// `SAVE_DIR` stands in for the sweep directory.
pub const HYPER: &str = r#"
log:
  save_path: "SAVE_DIR/log.txt"
slurm:
  jobs: 3
  batch:
    A: "NAML0001"
    t: "12:00:00"
    mem: "128GB"
  environment:
    - "source ~/.bashrc"
optuna:
  name: "mlp.db"
  save_path: "SAVE_DIR"
  reload: 0
  objective: "python train.py"
  direction: "minimize"
  metric: "val_loss"
  n_trials: 20
  gpu: false
  parameters:
    "model:dense_hidden_dim1":
      type: "int"
      settings:
        name: "dense_hidden_dim1"
        low: 10
        high: 1000
    "optimizer:lr":
      type: "loguniform"
      settings:
        name: "lr"
        low: 0.0000001
        high: 0.01
    "dropout":
      type: "float"
      settings:
        name: "dropout"
        low: 0.0
        high: 0.5
"#;

/// Model config matching [`HYPER`].
pub const MODEL: &str = r#"
model:
  dense_hidden_dim1: 100
  activation: "relu"
seed: 1000
"#;

/// Write `hyper.yml` (saving into `dir`) and `model.yml`; returns their paths.
pub fn write_sweep(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let hyper = dir.join("hyper.yml");
    let model = dir.join("model.yml");
    std::fs::write(&hyper, HYPER.replace("SAVE_DIR", &dir.display().to_string())).unwrap();
    std::fs::write(&model, MODEL).unwrap();
    (hyper, model)
}
