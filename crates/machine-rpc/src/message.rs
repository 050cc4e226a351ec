//! Request and response types carried inside frames

use serde::{Deserialize, Serialize};

/// A call from the host to a driver plugin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    /// Keeps the plugin alive. Plugins exit when these stop arriving.
    Heartbeat,
    /// Returns the driver's name
    DriverName,
    /// Returns the machine name the driver was configured with
    GetMachineName,
    /// Validates the host before a create
    PreCreateCheck,
    /// Returns the driver's serialized state ("RawDriver")
    GetConfigRaw,
    /// Replaces the driver's state with a previously serialized blob
    SetConfigRaw {
        /// The blob returned by an earlier [`Request::GetConfigRaw`]
        config: serde_json::Value,
    },
    /// Allocates the VM or container for a node
    Create {
        /// The cluster configuration, as persisted in the profile
        config: serde_json::Value,
        /// The node being created
        node: serde_json::Value,
    },
    /// Boots a stopped machine
    Start,
    /// Gracefully stops a machine
    Stop,
    /// Stops then starts a machine
    Restart,
    /// Deletes the machine and everything the driver owns for it
    Remove,
    /// Forcefully stops a machine
    Kill,
    /// Returns the machine's IP address
    GetIp,
    /// Returns the hostname to use for SSH
    GetSshHostname,
    /// Returns the port to use for SSH
    GetSshPort,
    /// Returns the private key path to use for SSH
    GetSshKeyPath,
    /// Returns the user to log in as over SSH
    GetSshUsername,
    /// Returns the machine's [`MachineState`]
    GetState,
    /// Returns the Docker endpoint URL inside the machine
    GetUrl,
}

impl Request {
    /// The method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Heartbeat => "Heartbeat",
            Request::DriverName => "DriverName",
            Request::GetMachineName => "GetMachineName",
            Request::PreCreateCheck => "PreCreateCheck",
            Request::GetConfigRaw => "GetConfigRaw",
            Request::SetConfigRaw { .. } => "SetConfigRaw",
            Request::Create { .. } => "Create",
            Request::Start => "Start",
            Request::Stop => "Stop",
            Request::Restart => "Restart",
            Request::Remove => "Remove",
            Request::Kill => "Kill",
            Request::GetIp => "GetIp",
            Request::GetSshHostname => "GetSshHostname",
            Request::GetSshPort => "GetSshPort",
            Request::GetSshKeyPath => "GetSshKeyPath",
            Request::GetSshUsername => "GetSshUsername",
            Request::GetState => "GetState",
            Request::GetUrl => "GetUrl",
        }
    }
}

/// A request paired with its call id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Monotonic id chosen by the caller
    pub id: u64,
    /// The call itself
    pub request: Request,
}

/// The reply to a [`RequestFrame`] with the same id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    /// The id of the request being answered
    pub id: u64,
    /// The call's return value; `null` for calls that return nothing
    #[serde(default)]
    pub result: serde_json::Value,
    /// Set when the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful reply.
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Response {
            id,
            result,
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Response {
            id,
            result: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// The lifecycle state a driver reports for its machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    /// The driver has no machine
    None,
    /// The machine is booting
    Starting,
    /// The machine is up
    Running,
    /// The machine is suspended
    Paused,
    /// The machine is shutting down
    Stopping,
    /// The machine is off
    Stopped,
    /// The driver could not determine the state
    Error,
    /// The driver timed out while determining the state
    Timeout,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::None => "",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Stopping => "Stopping",
            MachineState::Stopped => "Stopped",
            MachineState::Error => "Error",
            MachineState::Timeout => "Timeout",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MachineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "None" => Ok(MachineState::None),
            "Starting" => Ok(MachineState::Starting),
            "Running" => Ok(MachineState::Running),
            "Paused" => Ok(MachineState::Paused),
            "Stopping" => Ok(MachineState::Stopping),
            "Stopped" => Ok(MachineState::Stopped),
            "Error" => Ok(MachineState::Error),
            "Timeout" => Ok(MachineState::Timeout),
            other => Err(format!("unknown machine state {:?}", other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requests_are_adjacently_tagged() {
        let frame = RequestFrame {
            id: 3,
            request: Request::SetConfigRaw {
                config: serde_json::json!({"MachineName": "minikube"}),
            },
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["id"], 3);
        assert_eq!(v["request"]["method"], "SetConfigRaw");
        assert_eq!(v["request"]["params"]["config"]["MachineName"], "minikube");

        let unit = serde_json::to_value(&RequestFrame {
            id: 4,
            request: Request::Start,
        })
        .unwrap();
        assert_eq!(unit["request"]["method"], "Start");
    }

    #[test]
    fn error_field_is_omitted_on_success() {
        let v = serde_json::to_value(Response::ok(1, serde_json::json!("10.0.0.2"))).unwrap();
        assert!(v.get("error").is_none());
        assert_eq!(v["result"], "10.0.0.2");
    }

    #[test]
    fn state_parses_its_own_display() {
        for s in &[
            MachineState::Running,
            MachineState::Stopped,
            MachineState::Paused,
            MachineState::None,
        ] {
            assert_eq!(s.to_string().parse::<MachineState>().unwrap(), *s);
        }
        assert!("Exploded".parse::<MachineState>().is_err());
    }
}
