//! Built-in `sys_*` calls answered by the client itself.

use serde_json::Value;

/// A call the directory makes into the client's own machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    /// `sys_reg`: registration challenge.
    Challenge,
    /// `sys_regOk`: registration confirmed.
    Confirm,
    /// `sys_regErr`: registration rejected.
    Reject,
    /// `sys_ping`: liveness probe.
    Ping,
    /// `sys_getFunctions`: list exposed names.
    GetFunctions,
    /// `sys_log`: relay a log line from the directory.
    Log,
    /// `sys_close`: directory asks the client to go away.
    Close,
}

impl SystemCall {
    /// Every system call, in function-list order.
    pub const ALL: [SystemCall; 7] = [
        SystemCall::Challenge,
        SystemCall::Confirm,
        SystemCall::Reject,
        SystemCall::Ping,
        SystemCall::GetFunctions,
        SystemCall::Log,
        SystemCall::Close,
    ];

    /// Name on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            SystemCall::Challenge => "sys_reg",
            SystemCall::Confirm => "sys_regOk",
            SystemCall::Reject => "sys_regErr",
            SystemCall::Ping => "sys_ping",
            SystemCall::GetFunctions => "sys_getFunctions",
            SystemCall::Log => "sys_log",
            SystemCall::Close => "sys_close",
        }
    }

    /// Resolve a call name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|call| call.wire_name().eq_ignore_ascii_case(name))
    }

    /// Check if this call belongs to the registration handshake.
    ///
    /// Only these are accepted before the connection is trusted.
    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, SystemCall::Challenge | SystemCall::Confirm | SystemCall::Reject)
    }
}

/// Lowercase names of the system calls, as they appear in the function list.
pub fn system_names() -> impl Iterator<Item = String> {
    SystemCall::ALL.into_iter().map(|call| call.wire_name().to_lowercase())
}

/// Forward a log line sent by the directory to the local subscriber.
///
/// Severities: `debug`, `warn`, `info`; anything else (including `log`) is
/// logged at info.
pub fn relay_log(args: &[Value]) {
    let kind = args.first().and_then(Value::as_str).unwrap_or("log");
    let message = match args.get(1) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let data = args.get(2).filter(|v| !v.is_null()).map(Value::to_string).unwrap_or_default();

    match kind {
        "debug" => tracing::debug!(target: "servicereg::remote", data = %data, "{}", message),
        "warn" => tracing::warn!(target: "servicereg::remote", data = %data, "{}", message),
        _ => tracing::info!(target: "servicereg::remote", data = %data, "{}", message),
    }
}
