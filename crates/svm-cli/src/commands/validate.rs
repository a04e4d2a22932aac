use std::path::Path;

use svm_core::TopologyConfig;
use svm_scheduler::VpuScheduler;

pub fn validate(path: &Path) -> anyhow::Result<()> {
    let topology = TopologyConfig::from_file(path)?;
    // Building the scheduler also admits every initial object.
    let scheduler = VpuScheduler::from_topology(&topology)?;

    println!(
        "✓ {} is valid: {} streams ({} compute types), {} initial objects",
        path.display(),
        scheduler.streams().len(),
        topology.compute_stream_types().len(),
        topology.objects.len()
    );
    Ok(())
}
