//! Lesson definitions as read from the curriculum
//!
//! A lesson is immutable for the life of a LiveLesson. The order of
//! `endpoints` is load-bearing: pods are created in this order and the
//! per-network IPAM hands out addresses sequentially.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the endpoint synthesized for Jupyter lab guides
pub const JUPYTER_ENDPOINT_NAME: &str = "jupyterlabguide";

/// Port the Jupyter lab guide server listens on
pub const JUPYTER_PORT: u16 = 8888;

/// A lesson definition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    /// Unique slug (e.g. "bgp-basics")
    pub slug: String,
    /// Human-readable name
    pub name: String,
    /// Directory of this lesson inside the curriculum repository
    pub lesson_dir: String,
    /// Endpoints in declared order
    #[serde(default)]
    pub endpoints: Vec<LessonEndpoint>,
    /// Point-to-point links between endpoints
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Content stages; stage numbers start at 1 but stage 0 may exist as a placeholder
    #[serde(default)]
    pub stages: Vec<LessonStage>,
    /// Seconds to wait after configuration before declaring the lab ready
    #[serde(default)]
    pub ready_delay: u64,
}

impl Lesson {
    /// True if any stage renders its guide through Jupyter
    pub fn uses_jupyter_guide(&self) -> bool {
        self.stages.iter().any(|s| s.guide_type == GuideType::Jupyter)
    }

    /// Look up a stage by its index
    pub fn stage(&self, stage: u32) -> Option<&LessonStage> {
        self.stages.get(stage as usize)
    }

    /// Endpoints in creation order, with the lab-guide endpoint appended when needed
    pub fn ordered_endpoints(&self) -> Vec<LessonEndpoint> {
        let mut endpoints = self.endpoints.clone();
        if self.uses_jupyter_guide() {
            endpoints.push(LessonEndpoint::jupyter_lab_guide());
        }
        endpoints
    }

    /// Names of the networks each endpoint must join, derived from `connections`
    pub fn networks_for(&self, endpoint: &str) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.a == endpoint || c.b == endpoint)
            .map(Connection::network_name)
            .collect()
    }
}

/// One workload unit in a lesson
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LessonEndpoint {
    /// Endpoint name (DNS-label safe)
    pub name: String,
    /// Image reference, resolved against the image catalog for credentials
    pub image: String,
    /// Configuration mechanism (e.g. "napalm", "ansible", "python")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_type: Option<String>,
    /// Ports exposed without a presentation
    #[serde(default)]
    pub additional_ports: Vec<u16>,
    /// Named protocol exposures
    #[serde(default)]
    pub presentations: Vec<Presentation>,
}

impl LessonEndpoint {
    /// All ports this endpoint exposes, presentations first, without duplicates
    pub fn ports(&self) -> Vec<u16> {
        let mut seen = BTreeSet::new();
        self.presentations
            .iter()
            .map(|p| p.port)
            .chain(self.additional_ports.iter().copied())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// The auxiliary endpoint serving Jupyter lab guides
    pub fn jupyter_lab_guide() -> Self {
        Self {
            name: JUPYTER_ENDPOINT_NAME.to_string(),
            image: "jupyter".to_string(),
            configuration_type: None,
            additional_ports: vec![],
            presentations: vec![Presentation {
                name: "web".to_string(),
                port: JUPYTER_PORT,
                type_: PresentationType::Http,
            }],
        }
    }
}

/// A named, typed network exposure of an endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presentation {
    /// Presentation name (e.g. "cli", "web")
    pub name: String,
    /// Port on the endpoint
    pub port: u16,
    /// Protocol type
    #[serde(rename = "type")]
    pub type_: PresentationType,
}

/// Protocol of a presentation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresentationType {
    /// Terminal access over SSH
    Ssh,
    /// Web UI over HTTP
    Http,
    /// Remote desktop over VNC
    Vnc,
}

impl std::fmt::Display for PresentationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::Http => write!(f, "http"),
            Self::Vnc => write!(f, "vnc"),
        }
    }
}

/// Second octet of the first default link subnet
const DEFAULT_SUBNET_SECOND_OCTET: usize = 10;

/// A link between two endpoints
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// First endpoint name
    pub a: String,
    /// Second endpoint name
    pub b: String,
    /// Subnet for the link (CIDR); derived from the link index when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

impl Connection {
    /// Network name derived from the two endpoint names
    pub fn network_name(&self) -> String {
        format!("{}-{}-net", self.a, self.b)
    }

    /// Subnet for this link, falling back to the `index`th /24 counted from
    /// `10.10.0.0`
    ///
    /// Past 256 links the third octet wraps into the second, so link 256 gets
    /// `10.11.0.0/24`. Indexes beyond `10.255.255.0/24` are rejected.
    pub fn subnet_or_default(&self, index: usize) -> Result<String> {
        if let Some(subnet) = &self.subnet {
            return Ok(subnet.clone());
        }
        let second = DEFAULT_SUBNET_SECOND_OCTET + index / 256;
        if second > 255 {
            return Err(Error::validation_for(
                self.network_name(),
                format!("link index {} exhausts the default subnet pool", index),
            ));
        }
        Ok(format!("10.{}.{}.0/24", second, index % 256))
    }
}

/// One content stage of a lesson
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LessonStage {
    /// Short description
    #[serde(default)]
    pub description: String,
    /// How the lab guide for this stage is rendered
    #[serde(default)]
    pub guide_type: GuideType,
    /// Configuration files shipped with this stage (`<endpoint>.<ext>`)
    #[serde(default)]
    pub configs: Vec<String>,
}

impl LessonStage {
    /// Configuration file for an endpoint in this stage, if any
    pub fn config_for(&self, endpoint: &str) -> Option<&str> {
        self.configs
            .iter()
            .map(String::as_str)
            .find(|file| file.rsplit_once('.').map(|(stem, _)| stem) == Some(endpoint))
    }
}

/// Lab-guide format
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuideType {
    /// Plain markdown, rendered by the front end
    #[default]
    Markdown,
    /// Jupyter notebook, served by an auxiliary endpoint
    Jupyter,
}

/// Image catalog entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image name as referenced by endpoints
    pub name: String,
    /// Username for SSH and configuration access
    #[serde(default)]
    pub ssh_user: String,
    /// Password for SSH and configuration access
    #[serde(default)]
    pub ssh_password: String,
    /// NAPALM driver for vendor-driver configuration (e.g. "junos")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub napalm_driver: Option<String>,
}
