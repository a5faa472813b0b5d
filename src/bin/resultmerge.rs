use std::path::PathBuf;
use std::sync::Arc;

use resultmerge::{
    ConfigOverrides, JobOverrides, MatrixHandle, MatrixObject, MergeConfig, MergeCoordinator,
};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn parse_all(flag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            if let Some(value) = args.next() {
                values.push(value);
            }
        }
    }
    values
}

fn parse_overrides() -> anyhow::Result<ConfigOverrides> {
    let job = JobOverrides {
        mappers: parse_arg("--mappers").map(|v| v.parse()).transpose()?,
        reducer_cap: parse_arg("--reducers").map(|v| v.parse()).transpose()?,
        replication: parse_arg("--replication").map(|v| v.parse()).transpose()?,
        max_task_attempts: parse_arg("--max-attempts").map(|v| v.parse()).transpose()?,
        worker_reuse: parse_arg("--worker-reuse").map(|v| v.parse()).transpose()?,
    };
    Ok(ConfigOverrides { job: Some(job) })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let baseline_path = parse_arg("--baseline")
        .ok_or_else(|| anyhow::anyhow!("--baseline <path> is required"))?;
    let output = parse_arg("--output")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("--output <path> is required"))?;
    let job_id: u64 = parse_arg("--job-id")
        .unwrap_or_else(|| "1".to_string())
        .parse()?;
    let config_path = parse_arg("--config").map(PathBuf::from);

    let config = MergeConfig::load(config_path.as_deref(), parse_overrides()?)?;
    let coordinator = MergeCoordinator::local(config);

    let baseline: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::open(&baseline_path)?);
    let mut partials = Vec::new();
    for path in parse_all("--partial") {
        let partial: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::open(&path)?);
        partials.push(Some(partial));
    }

    let merged = coordinator.merge(&baseline, &partials, &output, job_id)?;
    let mc = merged.characteristics();
    println!(
        "{} -> {} ({}x{}, {}, nnz={})",
        merged.var_name(),
        merged.file_name().display(),
        mc.rows,
        mc.cols,
        merged.format(),
        mc.nnz
    );
    Ok(())
}
