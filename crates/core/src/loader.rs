//! Checkpoint discovery and weight routing.
//!
//! A speculator checkpoint is a directory (local or on the Hub) holding a
//! `config.json` and one or more safetensors files whose tensor names start
//! with `speculator.`. The base model's `lm_head.weight` usually lives in a
//! different checkpoint, so routing tables span both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};

use crate::config::{SpeculationConfig, SpeculatorConfig};
use crate::error::{Result, SpeculatorError};
use crate::models::{MlpSpeculator, SpeculatorHead, TpContext};

pub struct SpeculatorFiles {
    pub config: SpeculatorConfig,
    /// Safetensors files in natural order.
    pub weights: Vec<PathBuf>,
}

/// Local checkpoint directory, or a Hub repo id when `source` is not a path.
pub fn locate_speculator(source: &str) -> Result<SpeculatorFiles> {
    let path = Path::new(source);
    if path.is_dir() {
        discover_local(path)
    } else {
        fetch_speculator(source)
    }
}

/// Read `config.json` and list every `*.safetensors` file in `dir`.
pub fn discover_local(dir: &Path) -> Result<SpeculatorFiles> {
    let config = read_config(&dir.join("config.json"))?;

    let mut weights = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            weights.push(path);
        }
    }
    if weights.is_empty() {
        return Err(SpeculatorError::config(format!(
            "no safetensors files in {}",
            dir.display()
        )));
    }
    weights.sort_by_cached_key(|p| natural_sort_key(p));

    tracing::debug!(dir = %dir.display(), files = weights.len(), "found local speculator");
    Ok(SpeculatorFiles { config, weights })
}

/// Download a speculator checkpoint from the HuggingFace Hub (or use the cache).
pub fn fetch_speculator(model_id: &str) -> Result<SpeculatorFiles> {
    let api = Api::new().map_err(hub_error)?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

    let config_path = repo.get("config.json").map_err(hub_error)?;
    let config = read_config(&config_path)?;
    let weights = hub_safetensor_paths(&repo)?;

    tracing::info!(model_id, files = weights.len(), "fetched speculator");
    Ok(SpeculatorFiles { config, weights })
}

fn read_config(path: &Path) -> Result<SpeculatorConfig> {
    let content = std::fs::read_to_string(path)?;
    SpeculatorConfig::from_json_str(&content)
}

fn hub_error(e: hf_hub::api::sync::ApiError) -> SpeculatorError {
    SpeculatorError::Hub(e.to_string())
}

fn hub_safetensor_paths(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get("model.safetensors.index.json").map_err(hub_error)?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| SpeculatorError::config("missing weight_map in index"))?;

    let mut filenames: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    filenames.sort_by_cached_key(|name| natural_sort_key(Path::new(name)));
    filenames.dedup();

    filenames
        .into_iter()
        .map(|name| repo.get(name).map_err(hub_error))
        .collect()
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortChunk {
    Number(u64),
    Text(String),
}

/// Split a file name into text and number runs so that `shard-2` sorts
/// before `shard-10`.
fn natural_sort_key(path: &Path) -> Vec<SortChunk> {
    let name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default();

    let mut chunks = Vec::new();
    let mut run = String::new();
    let mut in_digits = false;
    for c in name.chars() {
        if c.is_ascii_digit() != in_digits && !run.is_empty() {
            chunks.push(finish_chunk(&run, in_digits));
            run.clear();
        }
        in_digits = c.is_ascii_digit();
        run.push(c);
    }
    if !run.is_empty() {
        chunks.push(finish_chunk(&run, in_digits));
    }
    chunks
}

fn finish_chunk(run: &str, digits: bool) -> SortChunk {
    match (digits, run.parse::<u64>()) {
        (true, Ok(n)) => SortChunk::Number(n),
        _ => SortChunk::Text(run.to_string()),
    }
}

// ─── Routing ────────────────────────────────────────────────────────────────

/// Which file every tensor name comes from.
///
/// A name may only be claimed by one file; registering the same file twice
/// is harmless.
#[derive(Debug, Default, Clone)]
pub struct WeightRouting {
    routes: BTreeMap<String, PathBuf>,
    files: Vec<PathBuf>,
}

impl WeightRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every tensor of every file in `paths`.
    pub fn build(paths: &[PathBuf]) -> Result<Self> {
        let mut routing = Self::new();
        for path in paths {
            routing.add_file(path)?;
        }
        Ok(routing)
    }

    /// Scan a safetensors header and claim its tensor names.
    pub fn add_file(&mut self, path: &Path) -> Result<usize> {
        // The file is only read while scanning its header.
        let st = unsafe { MmapedSafetensors::new(path)? };
        let names: Vec<String> = st.tensors().into_iter().map(|(name, _)| name).collect();
        let count = names.len();
        self.add_names(path, names)?;
        tracing::trace!(file = %path.display(), tensors = count, "routed weight file");
        Ok(count)
    }

    /// Claim `names` for `path`.
    pub fn add_names<I, S>(&mut self, path: &Path, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            match self.routes.get(&name) {
                Some(existing) if existing != path => {
                    return Err(SpeculatorError::RoutingConflict {
                        name,
                        first: existing.display().to_string(),
                        second: path.display().to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    self.routes.insert(name, path.to_path_buf());
                }
            }
        }
        if !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_path_buf());
        }
        Ok(())
    }

    pub fn file_for(&self, name: &str) -> Option<&Path> {
        self.routes.get(name).map(PathBuf::as_path)
    }

    /// Routed names starting with `prefix`, in sorted order.
    pub fn names_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.routes
            .keys()
            .filter(move |name| name.starts_with(prefix))
            .map(String::as_str)
    }

    /// Distinct files in registration order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Memory-mapped var builder over every routed file.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        load_weights(&self.files, dtype, device)
    }
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(paths: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Build a standalone speculator from its checkpoint files.
pub fn load_speculator(
    files: &SpeculatorFiles,
    policy: &SpeculationConfig,
    dtype: DType,
    device: &Device,
    ctx: TpContext,
) -> Result<MlpSpeculator> {
    let routing = WeightRouting::build(&files.weights)?;
    let vb = routing.var_builder(dtype, device)?;
    MlpSpeculator::new(&files.config, policy, vb.pp("speculator"), ctx)
}

/// Build the combined head. `base_weights` must provide `lm_head.weight`;
/// names shared between base and speculator files are rejected.
pub fn load_speculator_head(
    base_weights: &[PathBuf],
    files: &SpeculatorFiles,
    policy: &SpeculationConfig,
    dtype: DType,
    device: &Device,
    ctx: TpContext,
) -> Result<SpeculatorHead> {
    let mut routing = WeightRouting::build(base_weights)?;
    for path in &files.weights {
        routing.add_file(path)?;
    }
    tracing::info!(
        tensors = routing.len(),
        files = routing.files().len(),
        "loading speculator head"
    );
    let vb = routing.var_builder(dtype, device)?;
    SpeculatorHead::load(&files.config, policy, vb, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        lm_head_weight, synthetic_checkpoint, tiny_speculator_config, write_safetensors,
    };
    use std::collections::HashMap;

    fn write_config(dir: &Path, cfg: &SpeculatorConfig) {
        let json = serde_json::to_string(cfg).unwrap();
        std::fs::write(dir.join("config.json"), json).unwrap();
    }

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            PathBuf::from("model-00010-of-00020.safetensors"),
            PathBuf::from("model-00002-of-00020.safetensors"),
            PathBuf::from("model-00001-of-00020.safetensors"),
            PathBuf::from("model-00011-of-00020.safetensors"),
        ];
        files.sort_by_cached_key(|p| natural_sort_key(p));
        assert_eq!(
            files,
            vec![
                PathBuf::from("model-00001-of-00020.safetensors"),
                PathBuf::from("model-00002-of-00020.safetensors"),
                PathBuf::from("model-00010-of-00020.safetensors"),
                PathBuf::from("model-00011-of-00020.safetensors"),
            ]
        );
    }

    #[test]
    fn natural_sort_ignores_directories() {
        let mut files = vec![
            PathBuf::from("/z/shard-10.safetensors"),
            PathBuf::from("/a/shard-2.safetensors"),
            PathBuf::from("/m/shard-1.safetensors"),
        ];
        files.sort_by_cached_key(|p| natural_sort_key(p));
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["shard-1.safetensors", "shard-2.safetensors", "shard-10.safetensors"]
        );
    }

    #[test]
    fn routing_rejects_name_in_two_files() {
        let mut routing = WeightRouting::new();
        routing
            .add_names(Path::new("a.safetensors"), ["speculator.emb.0.weight"])
            .unwrap();
        let err = routing
            .add_names(Path::new("b.safetensors"), ["speculator.emb.0.weight"])
            .unwrap_err();

        match err {
            SpeculatorError::RoutingConflict { name, first, second } => {
                assert_eq!(name, "speculator.emb.0.weight");
                assert_eq!(first, "a.safetensors");
                assert_eq!(second, "b.safetensors");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn routing_accepts_same_file_twice() {
        let mut routing = WeightRouting::new();
        let path = Path::new("a.safetensors");
        routing.add_names(path, ["x", "y"]).unwrap();
        routing.add_names(path, ["x"]).unwrap();

        assert_eq!(routing.len(), 2);
        assert_eq!(routing.files().len(), 1);
        assert_eq!(routing.file_for("y"), Some(path));
        assert_eq!(routing.file_for("z"), None);
    }

    #[test]
    fn routing_scans_safetensors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_speculator_config(true, false);
        let mut tensors = synthetic_checkpoint(&cfg);
        let head: HashMap<String, _> = tensors
            .remove_entry("speculator.head.0.weight")
            .into_iter()
            .collect();

        let first = dir.path().join("model-1.safetensors");
        let second = dir.path().join("model-2.safetensors");
        write_safetensors(&tensors, &first).unwrap();
        write_safetensors(&head, &second).unwrap();

        let routing = WeightRouting::build(&[first.clone(), second.clone()]).unwrap();
        assert_eq!(routing.len(), tensors.len() + 1);
        assert_eq!(routing.file_for("speculator.head.0.weight"), Some(second.as_path()));
        assert_eq!(routing.file_for("speculator.emb.0.weight"), Some(first.as_path()));
        assert_eq!(routing.names_with_prefix("speculator.ln.").count(), 2);
    }

    #[test]
    fn duplicated_tensor_across_files_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_speculator_config(true, false);
        let tensors = synthetic_checkpoint(&cfg);

        let first = dir.path().join("a.safetensors");
        let second = dir.path().join("b.safetensors");
        write_safetensors(&tensors, &first).unwrap();
        write_safetensors(&tensors, &second).unwrap();

        let err = WeightRouting::build(&[first, second]).unwrap_err();
        assert!(matches!(err, SpeculatorError::RoutingConflict { .. }));
        assert!(err.to_string().contains("multiple files"));
    }

    #[test]
    fn discover_and_load_local_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_speculator_config(false, true);
        write_config(dir.path(), &cfg);
        write_safetensors(&synthetic_checkpoint(&cfg), &dir.path().join("model.safetensors")).unwrap();

        let files = discover_local(dir.path()).unwrap();
        assert_eq!(files.weights.len(), 1);
        assert_eq!(files.config.n_predict, cfg.n_predict);

        let model = load_speculator(
            &files,
            &SpeculationConfig::default(),
            DType::F32,
            &Device::Cpu,
            TpContext::single_device(),
        )
        .unwrap();
        assert_eq!(model.parameter_counts().embeddings, cfg.n_predict);
        assert!(model.scales_input());
    }

    #[test]
    fn locate_prefers_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_speculator_config(true, true);
        write_config(dir.path(), &cfg);
        write_safetensors(&synthetic_checkpoint(&cfg), &dir.path().join("model.safetensors")).unwrap();

        let files = locate_speculator(dir.path().to_str().unwrap()).unwrap();
        assert!(files.config.tie_weights);
    }

    #[test]
    fn discover_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), &tiny_speculator_config(true, false));

        let err = discover_local(dir.path()).err().expect("no weights");
        assert!(matches!(err, SpeculatorError::Configuration(_)));
    }

    #[test]
    fn head_loads_from_base_and_speculator_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_speculator_config(true, true);
        write_config(dir.path(), &cfg);
        write_safetensors(&synthetic_checkpoint(&cfg), &dir.path().join("model.safetensors")).unwrap();

        let base_dir = tempfile::tempdir().unwrap();
        let base = base_dir.path().join("model.safetensors");
        let base_tensors: HashMap<String, _> =
            [("lm_head.weight".to_string(), lm_head_weight(&cfg))].into_iter().collect();
        write_safetensors(&base_tensors, &base).unwrap();

        let files = discover_local(dir.path()).unwrap();
        let head = load_speculator_head(
            &[base],
            &files,
            &SpeculationConfig::default(),
            DType::F32,
            &Device::Cpu,
            TpContext::single_device(),
        )
        .unwrap();
        assert_eq!(head.speculator().n_predict(), cfg.n_predict);
    }

    #[test]
    #[ignore] // requires network + disk space
    fn fetch_llama3_accelerator() {
        let files = fetch_speculator("ibm-fms/llama3-8b-accelerator").expect("fetch");
        assert_eq!(files.config.n_predict, 4);
        assert!(files.config.tie_weights);
        assert!(!files.weights.is_empty());
    }
}
