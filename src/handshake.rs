//! Registration handshake.
//!
//! Before a socket is trusted the directory drives three calls:
//!
//! ```text
//! directory                              client
//!    │ sys_reg(T, R, H, extend?) ─────────►│ verify H = sha1("T.R.xdapp.com"), |now - T| <= 180
//!    │◄──────── {status, app, name, time, rand, version, hash}
//!    │ sys_regOk(data, T, R, H) ──────────►│ verify H = registration hash, mark trusted
//!    │ sys_regErr(msg, data) ─────────────►│ fatal, close
//! ```
//!
//! The registration hash is `sha1("{app}.{service}.{T}.{R}.{key}.xdapp.com")`.
//! Every operation returns a [`Reply`]: the value to answer with and what to
//! do with the socket afterwards. Failures that point at a configuration
//! problem (bad hash, clock skew, short nonce, rejection) are [`Verdict::Fatal`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::Md5;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::handler::{system_names, HandlerRegistry};
use crate::state::ConnectionState;

/// Domain mixed into every handshake hash.
pub const HASH_DOMAIN: &str = "xdapp.com";

/// Largest accepted difference between directory and local clocks.
pub const MAX_CLOCK_SKEW_SECS: i64 = 180;

/// Shortest accepted confirmation nonce.
pub const MIN_NONCE_LEN: usize = 16;

/// Timeout for the public address lookup.
pub const IP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default base URL of the public address lookup.
pub const DEFAULT_IP_LOOKUP_URL: &str = "https://www.xdapp.com";

/// `sha1("{time}.{rand}.xdapp.com")`, hex encoded.
pub fn challenge_hash(time: &str, rand: &str) -> String {
    sha1_hex(&format!("{}.{}.{}", time, rand, HASH_DOMAIN))
}

/// `sha1("{app}.{service}.{time}.{rand}.{key}.xdapp.com")`, hex encoded.
pub fn registration_hash(app: &str, service: &str, time: &str, rand: &str, key: &str) -> String {
    sha1_hex(&format!("{}.{}.{}.{}.{}.{}", app, service, time, rand, key, HASH_DOMAIN))
}

/// `md5("{app}{time}.xdapp.com")`, hex encoded.
pub fn lookup_sign(app: &str, time: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}{}.{}", app, time, HASH_DOMAIN).as_bytes());
    hex::encode(hasher.finalize())
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Identity presented during registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Application name.
    pub app: String,
    /// Service name.
    pub service: String,
    /// Pre-shared key.
    pub key: String,
    /// Declared client version.
    pub version: String,
}

impl Credentials {
    /// Registration hash for `time` and `rand` with these credentials.
    pub fn hash(&self, time: &str, rand: &str) -> String {
        registration_hash(&self.app, &self.service, time, rand, &self.key)
    }
}

/// What happens to the socket after the reply is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep serving.
    Continue,
    /// Set the fatal flag and close; no reconnection.
    Fatal,
}

/// Result of a handshake operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Value returned to the directory.
    pub value: Value,
    /// Follow-up for the socket.
    pub verdict: Verdict,
}

impl Reply {
    fn ok(value: Value) -> Self {
        Self {
            value,
            verdict: Verdict::Continue,
        }
    }

    /// `{status: false, err}` without touching the socket.
    fn refused(err: String) -> Self {
        tracing::warn!("{}", err);
        Self {
            value: json!({ "status": false, "err": err }),
            verdict: Verdict::Continue,
        }
    }

    /// `{status: false, err}`, then fatal.
    fn failed(err: String) -> Self {
        tracing::warn!("{}", err);
        Self {
            value: json!({ "status": false, "err": err }),
            verdict: Verdict::Fatal,
        }
    }

    fn fatal(value: Value) -> Self {
        Self {
            value,
            verdict: Verdict::Fatal,
        }
    }
}

/// Public address lookup used by extended registration.
#[derive(Debug, Clone)]
pub struct IpLookup {
    client: reqwest::Client,
    base_url: String,
}

impl IpLookup {
    /// Create a lookup against `base_url` (scheme and host, no path).
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(IP_LOOKUP_TIMEOUT)
            .user_agent(concat!("servicereg-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Lookup URL for `app` at `time`.
    pub fn url(&self, app: &str, time: i64) -> String {
        format!(
            "{}/api/myip?appId={}&time={}&sign={}",
            self.base_url,
            app,
            time,
            lookup_sign(app, time)
        )
    }

    /// Fetch the address the lookup service sees us coming from.
    pub async fn lookup(&self, app: &str, time: i64) -> Result<String> {
        let response = self.client.get(self.url(app, time)).send().await?;
        Ok(response.text().await?)
    }
}

impl Default for IpLookup {
    fn default() -> Self {
        Self::new(DEFAULT_IP_LOOKUP_URL)
    }
}

/// The client side of the registration handshake.
pub struct Handshake {
    credentials: Credentials,
    state: Arc<ConnectionState>,
    registry: Arc<HandlerRegistry>,
    ip_lookup: IpLookup,
}

impl Handshake {
    /// Create the handshake for one service.
    pub fn new(
        credentials: Credentials,
        state: Arc<ConnectionState>,
        registry: Arc<HandlerRegistry>,
        ip_lookup: IpLookup,
    ) -> Self {
        Self {
            credentials,
            state,
            registry,
            ip_lookup,
        }
    }

    /// Credentials presented to the directory.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// `sys_reg(time, rand, hash, extend = false)`.
    ///
    /// `now` is the local Unix time; it is checked against `time` and sent
    /// back as the reply's own timestamp.
    pub async fn challenge(&self, args: &[Value], now: i64) -> Reply {
        if self.state.is_trusted() {
            return Reply::refused("sys_reg() received on an already registered connection".to_string());
        }

        let (time, rand, hash) = match (text_arg(args, 0), text_arg(args, 1), text_arg(args, 2)) {
            (Some(t), Some(r), Some(h)) => (t, r, h),
            _ => return Reply::failed("sys_reg() called with missing arguments".to_string()),
        };

        if !hash.eq_ignore_ascii_case(&challenge_hash(&time, &rand)) {
            return Reply::failed("sys_reg() hash verification failed".to_string());
        }

        let server_time = match time.parse::<i64>() {
            Ok(t) => t,
            Err(_) => return Reply::failed(format!("sys_reg() timestamp {:?} is not a number", time)),
        };
        let diff = now.abs_diff(server_time);
        if diff > MAX_CLOCK_SKEW_SECS.unsigned_abs() {
            return Reply::failed(format!(
                "sys_reg() request expired, check the system clock. Server time: {}, local time: {}, diff: {}",
                server_time, now, diff
            ));
        }

        let mut reply = json!({
            "status": true,
            "app": self.credentials.app,
            "name": self.credentials.service,
            "time": now,
            "rand": rand,
            "version": self.credentials.version,
            "hash": self.credentials.hash(&now.to_string(), &rand),
        });

        if args.get(3).is_some_and(truthy) {
            let ip = match self.ip_lookup.lookup(&self.credentials.app, now).await {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::warn!("Public address lookup failed: {}", e);
                    String::new()
                }
            };
            reply["ip"] = Value::String(ip);
        }

        self.state.registering();
        Reply::ok(reply)
    }

    /// `sys_regOk(data, time, rand, hash)`.
    pub fn confirm(&self, args: &[Value]) -> Reply {
        if self.state.is_trusted() {
            tracing::warn!("sys_regOk() received on an already registered connection, ignored");
            return Reply::ok(Value::Null);
        }

        let data = args.first().cloned().unwrap_or(Value::Null);
        let (time, rand, hash) = match (text_arg(args, 1), text_arg(args, 2), text_arg(args, 3)) {
            (Some(t), Some(r), Some(h)) => (t, r, h),
            _ => {
                tracing::warn!("sys_regOk() called with missing arguments");
                return Reply::fatal(Value::Null);
            }
        };

        if rand.len() < MIN_NONCE_LEN {
            tracing::warn!(
                "sys_regOk() nonce has {} characters, at least {} required",
                rand.len(),
                MIN_NONCE_LEN
            );
            return Reply::fatal(Value::Null);
        }

        if !hash.eq_ignore_ascii_case(&self.credentials.hash(&time, &rand)) {
            tracing::warn!("Service registration failed, confirmation hash mismatch");
            return Reply::fatal(Value::Null);
        }

        if !self.state.trust(data) {
            // Lost a race with another confirmation or a fatal error.
            return Reply::ok(Value::Null);
        }

        tracing::info!(
            "Service registered: {}->{}",
            self.credentials.app,
            self.credentials.service
        );
        let names: Vec<String> = system_names().chain(self.registry.names().iter().cloned()).collect();
        log_exposed(&partition_names(&names, &self.credentials.service), &self.credentials.service);

        Reply::ok(Value::Null)
    }

    /// `sys_regErr(msg, data)`.
    pub fn reject(&self, args: &[Value]) -> Reply {
        let message = args.first().and_then(Value::as_str).unwrap_or("registration rejected");
        let data = args.get(1).filter(|v| !v.is_null()).map(Value::to_string).unwrap_or_default();
        tracing::warn!(data = %data, "Service registration rejected: {}", message);
        Reply::fatal(Value::Null)
    }
}

/// Exposed names grouped for the operator log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExposedNames {
    /// `sys_*` calls.
    pub system: Vec<String>,
    /// Calls under the service's own prefix, reachable from the web.
    pub service: Vec<String>,
    /// Everything else.
    pub other: Vec<String>,
}

/// Group `names` by prefix, rendering `a_b_c` as `b.c()`.
pub fn partition_names(names: &[String], service: &str) -> ExposedNames {
    let mut groups = ExposedNames::default();
    for name in names {
        if name == "#" {
            continue;
        }
        match name.split_once('_') {
            None => groups.other.push(name.clone()),
            Some((prefix, rest)) => {
                let display = format!("{}()", rest.replace('_', "."));
                if prefix.eq_ignore_ascii_case("sys") {
                    groups.system.push(display);
                } else if prefix.eq_ignore_ascii_case(service) {
                    groups.service.push(display);
                } else {
                    groups.other.push(display);
                }
            }
        }
    }
    groups
}

fn log_exposed(groups: &ExposedNames, service: &str) {
    tracing::info!("System RPC: {}", groups.system.join(", "));
    tracing::info!("Exposed web RPC: {}", groups.service.join(", "));
    if !groups.other.is_empty() {
        tracing::info!("Exposed RPC not callable from the web: {}", groups.other.join(", "));
        tracing::info!("Prefix them with `{}_` to expose them to the web", service);
    }
}

fn text_arg(args: &[Value], index: usize) -> Option<String> {
    match args.get(index)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
