//! Configuration of a node process. A node runs one AODV engine over UDP on the
//! network interfaces listed here.
use crate::aodv::AodvConfig;
use crate::{AodvError, AodvErrorKind, AODV_PORT};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Port for application data, next to the AODV control port.
pub const DEFAULT_DATA_PORT: u16 = AODV_PORT + 1;

/// Configuration for a node object. Loaded from TOML by the `aodv_node` binary and
/// handed to `Node::new`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct NodeConfig {
    ///Name of the node. Used for the log file name.
    pub node_name: String,
    ///Directory for the node to operate. Must have RW access to it. Log files will be written here.
    pub work_dir: String,
    ///Names of the network interfaces to run AODV on.
    pub interfaces: Vec<String>,
    ///UDP port for AODV control messages.
    #[serde(default = "default_port")]
    pub port: u16,
    ///UDP port for data packets.
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    ///Should the node log operations to the terminal as well.
    #[serde(default)]
    pub term_log: bool,
    ///NOTE: TOML tables must come after plain values, so this field is kept last.
    ///Protocol parameters.
    #[serde(default)]
    pub aodv: AodvConfig,
}

fn default_port() -> u16 {
    AODV_PORT
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

impl NodeConfig {
    ///Creates a new configuration for a node with default settings.
    pub fn new() -> NodeConfig {
        NodeConfig {
            node_name: String::from("node1"),
            work_dir: String::from("."),
            interfaces: vec![String::from("wlan0")],
            port: AODV_PORT,
            data_port: DEFAULT_DATA_PORT,
            term_log: false,
            aodv: AodvConfig::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<NodeConfig, AodvError> {
        let mut file_content = String::new();
        let mut file = File::open(file_path.as_ref()).map_err(|e| {
            let err_msg = String::from("Failed to open configuration file");
            AodvError {
                kind: AodvErrorKind::Configuration(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;

        file.read_to_string(&mut file_content).map_err(|e| {
            let err_msg = String::from("Failed to read configuration file");
            AodvError {
                kind: AodvErrorKind::Configuration(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;
        let configuration: NodeConfig = toml::from_str(&file_content).map_err(|e| {
            let err_msg = String::from("Failed to deserialize configuration file");
            AodvError {
                kind: AodvErrorKind::Serialization(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;
        configuration.validate()?;
        Ok(configuration)
    }

    ///Writes the configuration to a TOML file.
    pub fn write_to_file<P: AsRef<Path>>(&self, file_path: P) -> Result<(), AodvError> {
        let data = toml::to_string(self).map_err(|e| AodvError {
            kind: AodvErrorKind::Serialization(String::from("Error serializing configuration")),
            cause: Some(Box::new(e)),
        })?;
        let mut file = File::create(file_path.as_ref()).map_err(|e| AodvError {
            kind: AodvErrorKind::Configuration(String::from("Error creating configuration file")),
            cause: Some(Box::new(e)),
        })?;
        write!(file, "{}", data).map_err(|e| AodvError {
            kind: AodvErrorKind::Configuration(String::from("Error writing configuration file")),
            cause: Some(Box::new(e)),
        })?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), AodvError> {
        if self.node_name.is_empty() {
            return Err(AodvErrorKind::Configuration(String::from("node_name can't be empty")).into());
        }
        if self.interfaces.is_empty() {
            return Err(AodvErrorKind::Configuration(String::from("At least one interface is required")).into());
        }
        if self.port == self.data_port {
            return Err(AodvErrorKind::Configuration(String::from(
                "Control and data ports must differ",
            ))
            .into());
        }
        self.aodv.validate()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::new()
    }
}
