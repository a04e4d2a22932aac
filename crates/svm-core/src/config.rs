//! topology.toml configuration parser.
//!
//! The topology is resolved entirely before scheduling begins: the set of
//! streams with their stream type, and the initial logical objects with the
//! control stream that binds each of them.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::types::LogicalObjectId;

/// Stream type name reserved for the control stream type.
pub const CONTROL_STREAM_TYPE: &str = "control";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Run compute instructions that become ready in the same pass on
    /// worker threads.
    #[serde(default = "default_parallel_compute")]
    pub parallel_compute: bool,
    /// Upper bound on scheduling passes per drain. `None` means unbounded.
    #[serde(default)]
    pub max_passes: Option<u64>,
}

fn default_parallel_compute() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            parallel_compute: default_parallel_compute(),
            max_passes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// `"control"` or a compute device tag such as `"cpu"` or `"cuda"`.
    pub stream_type: String,
}

impl StreamConfig {
    pub fn is_control(&self) -> bool {
        self.stream_type == CONTROL_STREAM_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub id: LogicalObjectId,
    /// Control stream that creates the binding.
    pub stream: String,
    pub parallel_num: u32,
    #[serde(default)]
    pub is_remote: bool,
}

impl TopologyConfig {
    /// Parse a topology from TOML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: TopologyConfig = toml::from_str(text)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading topology from {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("writing topology to {}", path.display()))?;
        Ok(())
    }

    /// Look up a stream by name.
    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Distinct compute device tags, in first-appearance order.
    pub fn compute_stream_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.streams
            .iter()
            .filter(|s| !s.is_control())
            .map(|s| s.stream_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Check that the topology is internally consistent.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                bail!("stream name must not be empty");
            }
            if stream.stream_type.is_empty() {
                bail!("stream {:?} has an empty stream_type", stream.name);
            }
            if !names.insert(stream.name.as_str()) {
                bail!("duplicate stream name {:?}", stream.name);
            }
        }

        let mut bindings = HashSet::new();
        for object in &self.objects {
            let Some(stream) = self.stream(&object.stream) else {
                bail!("object {} refers to unknown stream {:?}", object.id, object.stream);
            };
            if !stream.is_control() {
                bail!(
                    "object {} must be bound by a control stream, {:?} is {:?}",
                    object.id,
                    stream.name,
                    stream.stream_type
                );
            }
            if object.parallel_num == 0 {
                bail!("object {} has parallel_num 0", object.id);
            }
            if !bindings.insert((object.id, object.stream.as_str())) {
                bail!("object {} is bound twice on stream {:?}", object.id, object.stream);
            }
        }
        Ok(())
    }

    /// Scaffold a topology with one control stream and `devices` compute
    /// streams of the given device tag.
    pub fn scaffold(device: &str, devices: u32) -> Self {
        let mut streams = vec![StreamConfig {
            name: CONTROL_STREAM_TYPE.to_string(),
            stream_type: CONTROL_STREAM_TYPE.to_string(),
        }];
        streams.extend((0..devices).map(|i| StreamConfig {
            name: format!("{device}{i}"),
            stream_type: device.to_string(),
        }));
        TopologyConfig {
            scheduler: SchedulerSettings::default(),
            streams,
            objects: Vec::new(),
        }
    }
}
