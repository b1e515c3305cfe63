//! Runtime settings
//!
//! Every value can come from the command line (or its `FLEET_*` environment
//! variable), from an optional JSON settings file, or from the built-in
//! default, in that order of precedence.

use anyhow::{Context, Result};
use clap::Args;
use fleet_dispatch::{DispatchConfig, ScannerConfig};
use fleet_tunnel::BrokerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings flags shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// JSON settings file
    #[arg(long, short = 'c', env = "FLEET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Address agents connect to
    #[arg(long, env = "FLEET_AGENT_ADDR", global = true)]
    pub agent_addr: Option<SocketAddr>,

    /// Address callers send requests to forward to
    #[arg(long, env = "FLEET_FORWARD_ADDR", global = true)]
    pub forward_addr: Option<SocketAddr>,

    /// Scanner HTTP address
    #[arg(long, env = "FLEET_SCANNER_ADDR", global = true)]
    pub scanner_addr: Option<SocketAddr>,

    /// Secret required by GET /status
    #[arg(long, env = "FLEET_SECRET", global = true)]
    pub secret: Option<String>,

    /// Accounts to import at startup (JSON list of {username,password,provider})
    #[arg(long, env = "FLEET_ACCOUNTS_FILE", global = true)]
    pub accounts_file: Option<PathBuf>,

    /// Canned map payload served by the test mode upstream
    #[arg(long, env = "FLEET_MOCK_PAYLOAD", global = true)]
    pub mock_payload: Option<PathBuf>,

    /// Sessions to log in before the first scan
    #[arg(long, env = "FLEET_INITIAL_SESSIONS", global = true)]
    pub initial_sessions: Option<usize>,

    /// Cooldown of a session between two scans, in seconds
    #[arg(long, env = "FLEET_SCAN_DELAY", global = true)]
    pub scan_delay_secs: Option<u64>,

    /// Minimum spacing of map calls, in milliseconds
    #[arg(long, env = "FLEET_CALL_INTERVAL_MS", global = true)]
    pub call_interval_ms: Option<u64>,

    /// Minimum spacing of logins, in milliseconds
    #[arg(long, env = "FLEET_LOGIN_INTERVAL_MS", global = true)]
    pub login_interval_ms: Option<u64>,

    /// Pool wait before provisioning a new session, in seconds
    #[arg(long, env = "FLEET_CHECKOUT_TIMEOUT", global = true)]
    pub checkout_timeout_secs: Option<u64>,

    /// Deadline of one scan request, in seconds
    #[arg(long, env = "FLEET_REQUEST_TIMEOUT", global = true)]
    pub request_timeout_secs: Option<u64>,

    /// Deadline of one forwarded request, in seconds
    #[arg(long, env = "FLEET_FORWARD_TIMEOUT", global = true)]
    pub forward_timeout_secs: Option<u64>,

    /// Interval of the inventory maintenance sweep, in seconds
    #[arg(long, env = "FLEET_SWEEP_INTERVAL", global = true)]
    pub sweep_interval_secs: Option<u64>,
}

/// Settings file format; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub agent_addr: Option<SocketAddr>,
    pub forward_addr: Option<SocketAddr>,
    pub scanner_addr: Option<SocketAddr>,
    pub secret: Option<String>,
    pub accounts_file: Option<PathBuf>,
    pub mock_payload: Option<PathBuf>,
    pub initial_sessions: Option<usize>,
    pub scan_delay_secs: Option<u64>,
    pub call_interval_ms: Option<u64>,
    pub login_interval_ms: Option<u64>,
    pub checkout_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub forward_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub agent_addr: SocketAddr,
    pub forward_addr: SocketAddr,
    pub scanner_addr: SocketAddr,
    pub secret: String,
    pub accounts_file: Option<PathBuf>,
    pub mock_payload: Option<PathBuf>,
    pub initial_sessions: usize,
    pub scan_delay: Duration,
    pub call_interval: Duration,
    pub login_interval: Duration,
    pub checkout_timeout: Duration,
    pub request_timeout: Duration,
    pub forward_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        let dispatch = DispatchConfig::default();
        Self {
            agent_addr: broker.agent_addr,
            forward_addr: broker.forward_addr,
            scanner_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            secret: String::new(),
            accounts_file: None,
            mock_payload: None,
            initial_sessions: 1,
            scan_delay: dispatch.cooldown,
            call_interval: dispatch.call_interval,
            login_interval: dispatch.login_interval,
            checkout_timeout: dispatch.checkout_timeout,
            request_timeout: dispatch.request_timeout,
            forward_timeout: broker.forward_timeout,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Load the JSON settings file
pub fn load_settings_file(path: &Path) -> Result<SettingsFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let file: SettingsFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

    Ok(file)
}

impl Settings {
    /// Read the settings file named by `args`, if any, and resolve
    pub fn load(args: &SettingsArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => load_settings_file(path)?,
            None => SettingsFile::default(),
        };
        Ok(Self::resolve(args, file))
    }

    /// CLI/env over file over defaults, field by field
    pub fn resolve(args: &SettingsArgs, file: SettingsFile) -> Self {
        let defaults = Self::default();
        let secs = Duration::from_secs;
        let millis = Duration::from_millis;

        Self {
            agent_addr: args
                .agent_addr
                .or(file.agent_addr)
                .unwrap_or(defaults.agent_addr),
            forward_addr: args
                .forward_addr
                .or(file.forward_addr)
                .unwrap_or(defaults.forward_addr),
            scanner_addr: args
                .scanner_addr
                .or(file.scanner_addr)
                .unwrap_or(defaults.scanner_addr),
            secret: args
                .secret
                .clone()
                .or(file.secret)
                .unwrap_or(defaults.secret),
            accounts_file: args.accounts_file.clone().or(file.accounts_file),
            mock_payload: args.mock_payload.clone().or(file.mock_payload),
            initial_sessions: args
                .initial_sessions
                .or(file.initial_sessions)
                .unwrap_or(defaults.initial_sessions),
            scan_delay: args
                .scan_delay_secs
                .or(file.scan_delay_secs)
                .map(secs)
                .unwrap_or(defaults.scan_delay),
            call_interval: args
                .call_interval_ms
                .or(file.call_interval_ms)
                .map(millis)
                .unwrap_or(defaults.call_interval),
            login_interval: args
                .login_interval_ms
                .or(file.login_interval_ms)
                .map(millis)
                .unwrap_or(defaults.login_interval),
            checkout_timeout: args
                .checkout_timeout_secs
                .or(file.checkout_timeout_secs)
                .map(secs)
                .unwrap_or(defaults.checkout_timeout),
            request_timeout: args
                .request_timeout_secs
                .or(file.request_timeout_secs)
                .map(secs)
                .unwrap_or(defaults.request_timeout),
            forward_timeout: args
                .forward_timeout_secs
                .or(file.forward_timeout_secs)
                .map(secs)
                .unwrap_or(defaults.forward_timeout),
            sweep_interval: args
                .sweep_interval_secs
                .or(file.sweep_interval_secs)
                .map(secs)
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            cooldown: self.scan_delay,
            checkout_timeout: self.checkout_timeout,
            request_timeout: self.request_timeout,
            login_interval: self.login_interval,
            call_interval: self.call_interval,
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            agent_addr: self.agent_addr,
            forward_addr: self.forward_addr,
            forward_timeout: self.forward_timeout,
            ..BrokerConfig::default()
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            bind_addr: self.scanner_addr,
            secret: self.secret.clone(),
        }
    }
}
