use std::fmt::Write as _;
use std::path::Path;

use anyhow::bail;
use serde::Serialize;
use tracing::{info, warn};

use svm_core::{StreamId, TopologyConfig};
use svm_scheduler::{DrainReport, Outcome, RegistrySnapshot, SchedulerError, VmService, VpuScheduler};

use crate::script::Script;

#[derive(Debug, Serialize)]
struct RunOutput {
    streams: Vec<String>,
    report: DrainReport,
    /// Streams left waiting on each other when the drain stalled.
    #[serde(skip_serializing_if = "Option::is_none")]
    deadlock: Option<Vec<StreamId>>,
    registry: RegistrySnapshot,
}

pub async fn run(topology: &Path, script: &Path, format: &str) -> anyhow::Result<()> {
    let topology = TopologyConfig::from_file(topology)?;
    let script = Script::from_file(script)?;
    let output = execute(&topology, &script).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&output)?),
        _ => print!("{}", format_output(&output)),
    }

    if let Some(streams) = &output.deadlock {
        bail!("{} stream(s) deadlocked", streams.len());
    }
    if !output.report.is_clean() {
        bail!(
            "{} instruction(s) failed, {} stream(s) halted",
            output.report.failures().count(),
            output.report.halted.len()
        );
    }
    Ok(())
}

async fn execute(topology: &TopologyConfig, script: &Script) -> anyhow::Result<RunOutput> {
    let scheduler = VpuScheduler::from_topology(topology)?;
    let batch = script.instructions(&scheduler)?;
    let streams = scheduler.streams().iter().map(|s| s.name().to_string()).collect();

    let service = VmService::new(scheduler);
    let submitted = service.submit_all(batch).await?;
    info!(submitted = submitted.len(), "script admitted");

    let (report, deadlock) = match service.drain_all().await {
        Ok(report) => (report, None),
        Err(SchedulerError::Deadlock { streams, report }) => (*report, Some(streams)),
        Err(e) => return Err(e.into()),
    };
    let registry = match service.shutdown().await {
        Ok(snapshot) => snapshot,
        Err(SchedulerError::ShutdownWithPendingWork { streams }) => {
            warn!(?streams, "streams still hold work, skipping shutdown");
            service.snapshot().await
        }
        Err(e) => return Err(e.into()),
    };

    Ok(RunOutput {
        streams,
        report,
        deadlock,
        registry,
    })
}

fn format_output(output: &RunOutput) -> String {
    let stream_name = |id: StreamId| {
        output
            .streams
            .get(id.index())
            .map(String::as_str)
            .unwrap_or("?")
    };

    let mut out = String::new();
    let report = &output.report;
    let _ = writeln!(
        out,
        "Dispatched {} instruction(s) in {} pass(es)",
        report.dispatched.len(),
        report.passes
    );
    for completion in &report.completions {
        let status = match &completion.outcome {
            Outcome::Completed => "ok".to_string(),
            Outcome::Failed { error } => format!("FAILED: {error}"),
            Outcome::Skipped => "skipped".to_string(),
        };
        let _ = writeln!(
            out,
            "  {:<10} {:<12} {:<28} {status}",
            completion.instruction.to_string(),
            stream_name(completion.stream),
            completion.opcode.name(),
        );
    }

    if !report.halted.is_empty() {
        let _ = writeln!(out, "\nHalted streams:");
        for halted in &report.halted {
            let _ = writeln!(
                out,
                "  {} at {}: {}",
                stream_name(halted.stream),
                halted.instruction,
                halted.error
            );
        }
    }

    if let Some(streams) = &output.deadlock {
        let _ = writeln!(out, "\nDeadlocked streams:");
        for stream in streams {
            let _ = writeln!(out, "  {}", stream_name(*stream));
        }
    }

    let _ = writeln!(out, "\nRegistry ({} binding(s)):", output.registry.bindings.len());
    for binding in &output.registry.bindings {
        let _ = writeln!(
            out,
            "  {} on {}{}",
            binding.logical_object_id,
            stream_name(binding.stream),
            if binding.is_remote { " (remote)" } else { "" }
        );
        for slot in &binding.slots {
            match &slot.data {
                Some(data) => {
                    let _ = writeln!(out, "    [{}] {data:?}", slot.parallel_id);
                }
                None => {
                    let _ = writeln!(out, "    [{}] remote", slot.parallel_id);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
[scheduler]
parallel_compute = true

[[streams]]
name = "control"
stream_type = "control"

[[streams]]
name = "cpu0"
stream_type = "cpu"

[[streams]]
name = "cpu1"
stream_type = "cpu"

[[objects]]
id = 1
stream = "control"
parallel_num = 2
"#;

    fn script(text: &str) -> Script {
        Script::parse(text).unwrap()
    }

    #[tokio::test]
    async fn test_execute_fill_then_sum() {
        let topology = TopologyConfig::parse(TOPOLOGY).unwrap();
        let script = script(
            r#"{ "steps": [
                { "op": "new_symbol", "stream": "control", "id": 2, "parallel_num": 1 },
                { "op": "compute", "stream": "cpu1", "kernel": "sum",
                  "operands": [{ "id": 1, "access": "read" }, { "id": 2, "access": "write" }] },
                { "op": "compute", "stream": "cpu0", "kernel": "fill", "args": [1.5, 2],
                  "operands": [{ "id": 1, "access": "write" }] }
            ] }"#,
        );

        let output = execute(&topology, &script).await.unwrap();
        assert!(output.report.is_clean());
        assert_eq!(output.report.dispatched.len(), 4);

        let total = output
            .registry
            .find(svm_core::LogicalObjectId::new(2), svm_core::StreamId::new(0))
            .unwrap();
        // The sum waits for object 2's creation, which lands in the same
        // pass as the fill, so it reads both filled replicas.
        assert_eq!(total.slots[0].data.as_deref(), Some(&[6.0][..]));

        let text = format_output(&output);
        assert!(text.contains("Dispatched 4 instruction(s)"), "{text}");
        assert!(text.contains("obj#2 on control"), "{text}");
    }

    #[tokio::test]
    async fn test_execute_reports_failures_and_halts() {
        let topology = TopologyConfig::parse(TOPOLOGY).unwrap();
        let script = script(
            r#"{ "steps": [
                { "op": "compute", "stream": "cpu0", "kernel": "fail",
                  "operands": [{ "id": 1, "access": "read" }] },
                { "op": "compute", "stream": "cpu1", "kernel": "copy",
                  "operands": [{ "id": 1, "access": "read" }, { "id": 9, "access": "write" }] }
            ] }"#,
        );

        let output = execute(&topology, &script).await.unwrap();
        assert_eq!(output.report.failures().count(), 1);
        assert_eq!(output.report.halted.len(), 1);
        assert_eq!(output.report.halted[0].stream, svm_core::StreamId::new(2));

        let text = format_output(&output);
        assert!(text.contains("FAILED: fail: failure requested by script"), "{text}");
        assert!(text.contains("Halted streams:"), "{text}");
        assert!(text.contains("cpu1 at"), "{text}");
    }

    #[tokio::test]
    async fn test_execute_surfaces_deadlock() {
        let topology = TopologyConfig::parse(TOPOLOGY).unwrap();
        let script = script(
            r#"{ "steps": [
                { "op": "compute", "stream": "cpu0", "kernel": "fill", "args": [0],
                  "operands": [{ "id": 5, "access": "write" }] },
                { "op": "compute", "stream": "cpu0", "kernel": "fill", "args": [0],
                  "operands": [{ "id": 1, "access": "write" }] },
                { "op": "delete_symbol", "stream": "control", "id": 1 },
                { "op": "new_symbol", "stream": "control", "id": 5, "parallel_num": 1 }
            ] }"#,
        );

        let output = execute(&topology, &script).await.unwrap();
        assert_eq!(output.deadlock, Some(vec![StreamId::new(0), StreamId::new(1)]));
        assert!(output.report.dispatched.is_empty());

        let text = format_output(&output);
        assert!(text.contains("Deadlocked streams:\n  control\n  cpu0\n"), "{text}");
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["deadlock"], serde_json::json!([0, 1]));
    }

    #[tokio::test]
    async fn test_execute_prints_stall_behind_halted_stream() {
        let topology = TopologyConfig::parse(TOPOLOGY).unwrap();
        let script = script(
            r#"{ "steps": [
                { "op": "new_symbol", "stream": "control", "id": 7, "parallel_num": 1 },
                { "op": "new_symbol", "stream": "control", "id": 7, "parallel_num": 1 },
                { "op": "new_symbol", "stream": "control", "id": 5, "parallel_num": 1 },
                { "op": "compute", "stream": "cpu1", "kernel": "fill", "args": [1],
                  "operands": [{ "id": 5, "access": "write" }] }
            ] }"#,
        );

        let output = execute(&topology, &script).await.unwrap();
        assert_eq!(output.deadlock, None);
        assert_eq!(output.report.dispatched.len(), 2);
        assert_eq!(output.report.halted.len(), 1);

        let text = format_output(&output);
        assert!(text.contains("Halted streams:\n  control at"), "{text}");
        assert!(!text.contains("Deadlocked"), "{text}");
        assert!(serde_json::to_value(&output).unwrap().get("deadlock").is_none());
    }
}
