//! Configuration for a simulated charge point
//!
//! Combines the connection identity, the runtime session defaults, the charging model
//! and the engine limits. The identity and runtime parts are persisted with the
//! charge point state.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Identity used when the configured one is blank
pub const DEFAULT_CP_ID: &str = "SIM_CP_0001";

/// WebSocket subprotocol offered to the central system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "ocpp1.6")]
    Ocpp16,
    #[serde(rename = "ocpp2.0.1")]
    Ocpp201,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ocpp16 => "ocpp1.6",
            Protocol::Ocpp201 => "ocpp2.0.1",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ocpp1.6" | "1.6" => Ok(Protocol::Ocpp16),
            "ocpp2.0.1" | "2.0.1" => Ok(Protocol::Ocpp201),
            other => Err(format!("unsupported protocol: {}", other)),
        }
    }
}

/// Connection identity and BootNotification fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargePointConfig {
    /// Central system WebSocket URL (without the charge point id)
    pub csms_url: String,

    /// Charge point identity (appended to the URL)
    pub cp_id: String,

    pub protocol: Protocol,

    /// Basic-auth user embedded in the URL when non-empty
    pub user: String,

    pub password: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    pub firmware_version: Option<String>,
}

impl Default for ChargePointConfig {
    fn default() -> Self {
        Self {
            csms_url: "wss://example-csms/ocpp/".to_string(),
            cp_id: DEFAULT_CP_ID.to_string(),
            protocol: Protocol::Ocpp16,
            user: String::new(),
            password: String::new(),
            vendor: "EVS-Sim".to_string(),
            model: "Browser-CP".to_string(),
            firmware_version: Some("3.0.0".to_string()),
        }
    }
}

impl ChargePointConfig {
    /// Identity with blank input replaced by the default
    pub fn effective_cp_id(&self) -> &str {
        match self.cp_id.trim() {
            "" => DEFAULT_CP_ID,
            id => id,
        }
    }

    /// Full endpoint URL: `<base>/<percent-encoded cp id>`, with userinfo if a user is set
    pub fn endpoint_url(&self) -> Result<String, EngineError> {
        let mut base = self.csms_url.trim().to_string();
        if base.is_empty() {
            return Err(EngineError::Url("URL required".into()));
        }

        let scheme_end = match base.find("://") {
            Some(pos) => pos + 3,
            None => return Err(EngineError::Url(format!("missing scheme: {}", base))),
        };
        let scheme = base[..scheme_end - 3].to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(EngineError::Url(format!(
                "scheme must be ws or wss, got {}",
                scheme
            )));
        }
        if scheme_end == base.len() {
            return Err(EngineError::Url(format!("missing host: {}", base)));
        }

        if !base.ends_with('/') {
            base.push('/');
        }
        base.push_str(&urlencoding::encode(self.effective_cp_id()));

        let user = self.user.trim();
        if !user.is_empty() {
            let userinfo = format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(&self.password)
            );
            base.insert_str(scheme_end, &userinfo);
        }

        Ok(base)
    }
}

/// Session defaults used by local and remote starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub connector_id: u32,
    pub id_tag: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connector_id: 1,
            id_tag: "DEMO1234".to_string(),
        }
    }
}

/// Largest jitter fraction accepted; larger values are clamped
pub const MAX_JITTER_FRACTION: f64 = 0.10;

/// Charging model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Cadence of power/current/SoC updates
    pub physical_tick: Duration,

    /// Cadence of energy accumulation and MeterValues
    pub telemetry_tick: Duration,

    pub target_power_kw: f64,

    pub nominal_current_a: f64,

    /// Half-width of the power jitter relative to target power
    pub jitter_fraction: f64,

    /// SoC gained per physical tick
    pub soc_step_percent: f64,

    pub initial_soc_percent: f64,

    /// Range for the randomized meterStart register value (Wh)
    pub meter_start_wh: Range<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            physical_tick: Duration::from_millis(1500),
            telemetry_tick: Duration::from_secs(5),
            target_power_kw: 7.4,
            nominal_current_a: 32.0,
            jitter_fraction: 0.04,
            soc_step_percent: 0.5,
            initial_soc_percent: 45.0,
            meter_start_wh: 1000..2000,
        }
    }
}

impl SimulationConfig {
    pub fn effective_jitter(&self) -> f64 {
        self.jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION)
    }
}

/// Engine limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outstanding CALLs older than this are failed; None waits until disconnect
    pub request_timeout: Option<Duration>,

    pub frame_log_capacity: usize,

    /// Lower bound for the heartbeat interval granted at boot
    pub min_heartbeat_interval: Duration,

    /// Heartbeat interval when the boot reply has none
    pub default_heartbeat_interval: Duration,

    /// Capacity of the command channels between handles and actors
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            frame_log_capacity: crate::frame_log::DEFAULT_CAPACITY,
            min_heartbeat_interval: Duration::from_secs(5),
            default_heartbeat_interval: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Heartbeat interval for a boot reply carrying `interval` seconds
    pub fn heartbeat_interval(&self, interval: Option<u64>) -> Duration {
        let granted = match interval {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.default_heartbeat_interval,
        };
        granted.max(self.min_heartbeat_interval)
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorConfig {
    pub charge_point: ChargePointConfig,
    pub runtime: RuntimeConfig,
    pub simulation: SimulationConfig,
    pub engine: EngineConfig,
}

impl SimulatorConfig {
    /// Create config with basic parameters
    pub fn new(cp_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            charge_point: ChargePointConfig {
                cp_id: cp_id.into(),
                csms_url: csms_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.charge_point.vendor = vendor.into();
        self.charge_point.model = model.into();
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.charge_point.firmware_version = Some(version.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.charge_point.protocol = protocol;
        self
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.charge_point.user = user.into();
        self.charge_point.password = password.into();
        self
    }

    pub fn with_connector(mut self, connector_id: u32) -> Self {
        self.runtime.connector_id = connector_id;
        self
    }

    pub fn with_id_tag(mut self, id_tag: impl Into<String>) -> Self {
        self.runtime.id_tag = id_tag.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine.request_timeout = timeout;
        self
    }

    pub fn with_frame_log_capacity(mut self, capacity: usize) -> Self {
        self.engine.frame_log_capacity = capacity;
        self
    }

    pub fn with_simulation(mut self, simulation: SimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }
}
