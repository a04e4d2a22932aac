use std::path::Path;

use anyhow::bail;
use tracing::info;

use svm_core::TopologyConfig;

pub fn init(device: &str, devices: u32, output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let topology = TopologyConfig::scaffold(device, devices);
    topology.validate()?;
    topology.to_file(output)?;
    info!(path = %output.display(), %device, devices, "topology scaffold written");
    println!("✓ Generated {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_parseable_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.toml");
        init("cuda", 3, &path, false).unwrap();

        let topology = TopologyConfig::from_file(&path).unwrap();
        assert_eq!(topology.streams.len(), 4);
        assert_eq!(topology.compute_stream_types(), vec!["cuda"]);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.toml");
        std::fs::write(&path, "# keep me\n").unwrap();

        assert!(init("cpu", 1, &path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# keep me\n");

        init("cpu", 1, &path, true).unwrap();
        assert!(TopologyConfig::from_file(&path).is_ok());
    }
}
