//! Login parameter negotiation and settings scoping
//!
//! Every text key exchanged during login belongs to a fixed vocabulary
//! ([`ParamKey`]). A key is either DECLARED (the initiator picks, the
//! target only observes) or NEGOTIATED (the target must select a
//! mutually acceptable value and return it), and is scoped either to a
//! single connection or to the whole session.
//!
//! The [`SessionSettingsNegotiator`] owns the authoritative values for
//! session-wide keys and accepts writes only while the leading
//! connection is still in Login Phase; [`ConnectionSettingsNegotiator`]
//! holds connection-local values and falls through to the session
//! negotiator, then to the key's static default. A lookup that reaches
//! neither is a `SettingsError` and must not happen once login has
//! completed.

use crate::error::{IscsiError, ScsiResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How a parameter's final value is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    /// The initiator determines the value and only informs the target.
    Declared,
    /// The target must select a mutually supported value and return it.
    Negotiated,
}

/// Whether a parameter binds one connection or the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    Connection,
    Session,
}

/// Session type fixed by the leading connection during login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    Normal,
    Discovery,
}

impl SessionKind {
    pub fn from_text(s: &str) -> Self {
        if s == "Discovery" {
            SessionKind::Discovery
        } else {
            SessionKind::Normal
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            SessionKind::Normal => "Normal",
            SessionKind::Discovery => "Discovery",
        }
    }
}

/// Header/data digest selection. The target only ever offers `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Digest {
    #[default]
    None,
    Crc32c,
}

impl Digest {
    pub fn text(&self) -> &'static str {
        match self {
            Digest::None => "None",
            Digest::Crc32c => "CRC32C",
        }
    }
}

/// The fixed vocabulary of login text keys the target understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    AuthMethod,
    HeaderDigest,
    DataDigest,
    MaxRecvDataSegmentLength,
    MaxConnections,
    MaxBurstLength,
    FirstBurstLength,
    DefaultTime2Wait,
    DefaultTime2Retain,
    MaxOutstandingR2T,
    DataPduInOrder,
    DataSequenceInOrder,
    ErrorRecoveryLevel,
    ImmediateData,
    InitialR2T,
    SessionType,
    TargetName,
    InitiatorName,
    InitiatorAlias,
    TargetAlias,
    SendTargets,
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Number(u32),
    Boolean(bool),
    Text(String),
}

impl ParamValue {
    /// Wire representation used in login/text responses.
    pub fn wire_text(&self) -> String {
        match self {
            ParamValue::Number(n) => n.to_string(),
            ParamValue::Boolean(true) => "Yes".to_string(),
            ParamValue::Boolean(false) => "No".to_string(),
            ParamValue::Text(s) => s.clone(),
        }
    }
}

impl ParamKey {
    pub fn from_text(s: &str) -> Option<Self> {
        Some(match s {
            "AuthMethod" => ParamKey::AuthMethod,
            "HeaderDigest" => ParamKey::HeaderDigest,
            "DataDigest" => ParamKey::DataDigest,
            "MaxRecvDataSegmentLength" => ParamKey::MaxRecvDataSegmentLength,
            "MaxConnections" => ParamKey::MaxConnections,
            "MaxBurstLength" => ParamKey::MaxBurstLength,
            "FirstBurstLength" => ParamKey::FirstBurstLength,
            "DefaultTime2Wait" => ParamKey::DefaultTime2Wait,
            "DefaultTime2Retain" => ParamKey::DefaultTime2Retain,
            "MaxOutstandingR2T" => ParamKey::MaxOutstandingR2T,
            "DataPDUInOrder" => ParamKey::DataPduInOrder,
            "DataSequenceInOrder" => ParamKey::DataSequenceInOrder,
            "ErrorRecoveryLevel" => ParamKey::ErrorRecoveryLevel,
            "ImmediateData" => ParamKey::ImmediateData,
            "InitialR2T" => ParamKey::InitialR2T,
            "SessionType" => ParamKey::SessionType,
            "TargetName" => ParamKey::TargetName,
            "InitiatorName" => ParamKey::InitiatorName,
            "InitiatorAlias" => ParamKey::InitiatorAlias,
            "TargetAlias" => ParamKey::TargetAlias,
            "SendTargets" => ParamKey::SendTargets,
            _ => return None,
        })
    }

    pub fn text(&self) -> &'static str {
        match self {
            ParamKey::AuthMethod => "AuthMethod",
            ParamKey::HeaderDigest => "HeaderDigest",
            ParamKey::DataDigest => "DataDigest",
            ParamKey::MaxRecvDataSegmentLength => "MaxRecvDataSegmentLength",
            ParamKey::MaxConnections => "MaxConnections",
            ParamKey::MaxBurstLength => "MaxBurstLength",
            ParamKey::FirstBurstLength => "FirstBurstLength",
            ParamKey::DefaultTime2Wait => "DefaultTime2Wait",
            ParamKey::DefaultTime2Retain => "DefaultTime2Retain",
            ParamKey::MaxOutstandingR2T => "MaxOutstandingR2T",
            ParamKey::DataPduInOrder => "DataPDUInOrder",
            ParamKey::DataSequenceInOrder => "DataSequenceInOrder",
            ParamKey::ErrorRecoveryLevel => "ErrorRecoveryLevel",
            ParamKey::ImmediateData => "ImmediateData",
            ParamKey::InitialR2T => "InitialR2T",
            ParamKey::SessionType => "SessionType",
            ParamKey::TargetName => "TargetName",
            ParamKey::InitiatorName => "InitiatorName",
            ParamKey::InitiatorAlias => "InitiatorAlias",
            ParamKey::TargetAlias => "TargetAlias",
            ParamKey::SendTargets => "SendTargets",
        }
    }

    pub fn scope(&self) -> ParamScope {
        match self {
            ParamKey::AuthMethod
            | ParamKey::HeaderDigest
            | ParamKey::DataDigest
            | ParamKey::MaxRecvDataSegmentLength
            | ParamKey::SendTargets => ParamScope::Connection,
            _ => ParamScope::Session,
        }
    }

    pub fn kind(&self) -> NegotiationKind {
        match self {
            ParamKey::SessionType
            | ParamKey::TargetName
            | ParamKey::InitiatorName
            | ParamKey::InitiatorAlias
            | ParamKey::TargetAlias
            | ParamKey::MaxRecvDataSegmentLength
            | ParamKey::SendTargets => NegotiationKind::Declared,
            _ => NegotiationKind::Negotiated,
        }
    }

    /// Static default, doubling as the target's own preference for
    /// negotiated keys. Keys without a default fail lookup until a
    /// value is declared or negotiated.
    pub fn default_value(&self) -> Option<ParamValue> {
        Some(match self {
            ParamKey::AuthMethod => ParamValue::Text("None".to_string()),
            ParamKey::HeaderDigest | ParamKey::DataDigest => ParamValue::Text("None".to_string()),
            ParamKey::MaxRecvDataSegmentLength => ParamValue::Number(8192),
            ParamKey::MaxConnections => ParamValue::Number(1),
            ParamKey::MaxBurstLength => ParamValue::Number(262_144),
            ParamKey::FirstBurstLength => ParamValue::Number(65_536),
            ParamKey::DefaultTime2Wait => ParamValue::Number(2),
            ParamKey::DefaultTime2Retain => ParamValue::Number(20),
            ParamKey::MaxOutstandingR2T => ParamValue::Number(1),
            ParamKey::DataPduInOrder => ParamValue::Boolean(true),
            ParamKey::DataSequenceInOrder => ParamValue::Boolean(true),
            ParamKey::ErrorRecoveryLevel => ParamValue::Number(0),
            ParamKey::ImmediateData => ParamValue::Boolean(true),
            ParamKey::InitialR2T => ParamValue::Boolean(false),
            ParamKey::SessionType => ParamValue::Text("Normal".to_string()),
            ParamKey::InitiatorAlias | ParamKey::TargetAlias => ParamValue::Text(String::new()),
            ParamKey::TargetName | ParamKey::InitiatorName | ParamKey::SendTargets => return None,
        })
    }

    fn parse_value(&self, raw: &str) -> ScsiResult<ParamValue> {
        match self.default_value() {
            Some(ParamValue::Number(_)) => raw
                .parse::<u32>()
                .map(ParamValue::Number)
                .map_err(|_| IscsiError::Negotiation(format!("{}={raw} is not numeric", self.text()))),
            Some(ParamValue::Boolean(_)) => match raw {
                "Yes" => Ok(ParamValue::Boolean(true)),
                "No" => Ok(ParamValue::Boolean(false)),
                _ => Err(IscsiError::Negotiation(format!("{}={raw} is not boolean", self.text()))),
            },
            _ => Ok(ParamValue::Text(raw.to_string())),
        }
    }
}

/// Session-wide authoritative parameter store.
///
/// Mutable only while the leading connection is in Login Phase; once
/// [`seal`](SessionSettingsNegotiator::seal) has been called, writes
/// fail, fixing session type, target name and the operational keys for
/// the remainder of the session.
#[derive(Debug, Default)]
pub struct SessionSettingsNegotiator {
    values: Mutex<HashMap<ParamKey, ParamValue>>,
    sealed: AtomicBool,
}

impl SessionSettingsNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ParamKey) -> Option<ParamValue> {
        self.values.lock().unwrap_or_else(|p| p.into_inner()).get(&key).cloned()
    }

    pub fn set(&self, key: ParamKey, value: ParamValue) -> ScsiResult<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(IscsiError::Settings(format!(
                "session-wide parameter {} written after leading login completed",
                key.text()
            )));
        }
        self.values.lock().unwrap_or_else(|p| p.into_inner()).insert(key, value);
        Ok(())
    }

    /// Freezes all session-wide values. Called when the leading
    /// connection transitions out of Login Phase.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// Connection-local negotiator layered over the session negotiator.
#[derive(Debug)]
pub struct ConnectionSettingsNegotiator {
    session: Arc<SessionSettingsNegotiator>,
    local: HashMap<ParamKey, ParamValue>,
    is_leading: bool,
}

impl ConnectionSettingsNegotiator {
    pub fn new(session: Arc<SessionSettingsNegotiator>, is_leading: bool) -> Self {
        ConnectionSettingsNegotiator { session, local: HashMap::new(), is_leading }
    }

    /// Effective value lookup: connection-local, then session-wide,
    /// then the key's static default.
    pub fn value(&self, key: ParamKey) -> ScsiResult<ParamValue> {
        if let Some(v) = self.local.get(&key) {
            return Ok(v.clone());
        }
        if let Some(v) = self.session.get(key) {
            return Ok(v);
        }
        key.default_value().ok_or_else(|| {
            IscsiError::Settings(format!("parameter {} has no declared value and no default", key.text()))
        })
    }

    /// Like [`value`](Self::value) but `None` for keys that were never
    /// set and have no default.
    pub fn value_opt(&self, key: ParamKey) -> Option<ParamValue> {
        self.local
            .get(&key)
            .cloned()
            .or_else(|| self.session.get(key))
            .or_else(|| key.default_value())
    }

    /// Record a value the initiator declared. Refused for keys whose
    /// mode is NEGOTIATED; those values must come out of a negotiation
    /// round instead.
    pub fn declare(&mut self, key: ParamKey, raw: &str) -> ScsiResult<()> {
        if key.kind() == NegotiationKind::Negotiated {
            return Err(IscsiError::Negotiation(format!(
                "{} is a negotiated key and cannot be declared",
                key.text()
            )));
        }
        let value = key.parse_value(raw)?;
        self.store(key, value)
    }

    /// Run one negotiation round for `key`: apply the key's selection
    /// policy to the initiator's proposal, record the agreed value, and
    /// return it (the caller echoes it to the initiator).
    pub fn negotiate(&mut self, key: ParamKey, proposed: &str) -> ScsiResult<ParamValue> {
        if key.kind() == NegotiationKind::Declared {
            return Err(IscsiError::Negotiation(format!(
                "{} is a declared key and cannot be negotiated",
                key.text()
            )));
        }
        let agreed = self.select(key, proposed)?;
        self.store(key, agreed.clone())?;
        Ok(agreed)
    }

    fn select(&self, key: ParamKey, proposed: &str) -> ScsiResult<ParamValue> {
        // "current" is the target's own preference or an earlier round's result
        let current = self.value(key)?;
        match key {
            // value-list keys: pick the first offer the target supports
            ParamKey::AuthMethod | ParamKey::HeaderDigest | ParamKey::DataDigest => {
                if proposed.split(',').any(|offer| offer == "None") {
                    Ok(ParamValue::Text("None".to_string()))
                } else if key == ParamKey::AuthMethod {
                    Err(IscsiError::Negotiation(format!(
                        "no mutually supported value for AuthMethod in \"{proposed}\""
                    )))
                } else {
                    Err(IscsiError::Digest(format!(
                        "initiator requires an unsupported {} (\"{proposed}\")",
                        key.text()
                    )))
                }
            }
            _ => {
                let offered = key.parse_value(proposed)?;
                match (offered, current) {
                    (ParamValue::Number(theirs), ParamValue::Number(ours)) => {
                        let agreed = if key == ParamKey::DefaultTime2Wait {
                            theirs.max(ours)
                        } else {
                            theirs.min(ours)
                        };
                        Ok(ParamValue::Number(agreed))
                    }
                    (ParamValue::Boolean(theirs), ParamValue::Boolean(ours)) => {
                        let agreed = if key == ParamKey::ImmediateData {
                            theirs && ours
                        } else {
                            // InitialR2T, DataPDUInOrder, DataSequenceInOrder
                            theirs || ours
                        };
                        Ok(ParamValue::Boolean(agreed))
                    }
                    _ => Err(IscsiError::Negotiation(format!(
                        "type mismatch negotiating {}",
                        key.text()
                    ))),
                }
            }
        }
    }

    fn store(&mut self, key: ParamKey, value: ParamValue) -> ScsiResult<()> {
        match key.scope() {
            ParamScope::Connection => {
                self.local.insert(key, value);
                Ok(())
            }
            ParamScope::Session => {
                if !self.is_leading {
                    return Err(IscsiError::Negotiation(format!(
                        "session-wide parameter {} may only be set over the leading connection",
                        key.text()
                    )));
                }
                self.session.set(key, value)
            }
        }
    }

    /// Apply one `key=value` pair from a login request. Negotiated keys
    /// produce a reply pair to echo; declared keys are recorded
    /// silently; unknown keys are answered `NotUnderstood`.
    pub fn apply(&mut self, key_text: &str, value: &str) -> ScsiResult<Option<(String, String)>> {
        let Some(key) = ParamKey::from_text(key_text) else {
            log::debug!("answering NotUnderstood for unknown login key {key_text}");
            return Ok(Some((key_text.to_string(), "NotUnderstood".to_string())));
        };
        match key.kind() {
            NegotiationKind::Declared => {
                self.declare(key, value)?;
                Ok(None)
            }
            NegotiationKind::Negotiated => {
                let agreed = self.negotiate(key, value)?;
                Ok(Some((key.text().to_string(), agreed.wire_text())))
            }
        }
    }

    pub fn is_leading(&self) -> bool {
        self.is_leading
    }

    /// Seal the underlying session negotiator, freezing session-wide
    /// values for the remainder of the session.
    pub fn seal_session(&self) {
        self.session.seal();
    }

    fn get_number(&self, key: ParamKey) -> ScsiResult<u32> {
        match self.value(key)? {
            ParamValue::Number(n) => Ok(n),
            other => Err(IscsiError::Settings(format!(
                "{} holds {:?}, expected a number",
                key.text(),
                other
            ))),
        }
    }

    fn get_boolean(&self, key: ParamKey) -> ScsiResult<bool> {
        match self.value(key)? {
            ParamValue::Boolean(b) => Ok(b),
            other => Err(IscsiError::Settings(format!(
                "{} holds {:?}, expected a boolean",
                key.text(),
                other
            ))),
        }
    }

    fn get_text_opt(&self, key: ParamKey) -> Option<String> {
        match self.value_opt(key) {
            Some(ParamValue::Text(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Materialize a typed snapshot of the effective connection and
    /// session parameters. Called once Login Phase completes; every
    /// key read here has a default, so this cannot fail post-login
    /// except through an internal invariant breach.
    pub fn settings(&self) -> ScsiResult<Settings> {
        let digest = |key| -> ScsiResult<Digest> {
            Ok(match self.value(key)? {
                ParamValue::Text(s) if s == "CRC32C" => Digest::Crc32c,
                _ => Digest::None,
            })
        };
        Ok(Settings {
            session_kind: SessionKind::from_text(
                &self.value(ParamKey::SessionType)?.wire_text(),
            ),
            target_name: self.get_text_opt(ParamKey::TargetName),
            initiator_name: self.get_text_opt(ParamKey::InitiatorName),
            max_recv_data_segment_length: self.get_number(ParamKey::MaxRecvDataSegmentLength)?,
            max_connections: self.get_number(ParamKey::MaxConnections)?,
            max_burst_length: self.get_number(ParamKey::MaxBurstLength)?,
            first_burst_length: self.get_number(ParamKey::FirstBurstLength)?,
            default_time2wait: self.get_number(ParamKey::DefaultTime2Wait)? as u16,
            default_time2retain: self.get_number(ParamKey::DefaultTime2Retain)? as u16,
            max_outstanding_r2t: self.get_number(ParamKey::MaxOutstandingR2T)?,
            error_recovery_level: self.get_number(ParamKey::ErrorRecoveryLevel)? as u8,
            immediate_data: self.get_boolean(ParamKey::ImmediateData)?,
            initial_r2t: self.get_boolean(ParamKey::InitialR2T)?,
            data_pdu_in_order: self.get_boolean(ParamKey::DataPduInOrder)?,
            data_sequence_in_order: self.get_boolean(ParamKey::DataSequenceInOrder)?,
            header_digest: digest(ParamKey::HeaderDigest)?,
            data_digest: digest(ParamKey::DataDigest)?,
        })
    }
}

/// Immutable snapshot of the effective connection/session parameters,
/// fixed when Login Phase completes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub session_kind: SessionKind,
    pub target_name: Option<String>,
    pub initiator_name: Option<String>,
    /// The initiator's declared receive limit, i.e. the largest data
    /// segment this target may send.
    pub max_recv_data_segment_length: u32,
    pub max_connections: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub error_recovery_level: u8,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub header_digest: Digest,
    pub data_digest: Digest,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leading(session: &Arc<SessionSettingsNegotiator>) -> ConnectionSettingsNegotiator {
        ConnectionSettingsNegotiator::new(session.clone(), true)
    }

    #[test]
    fn test_defaults_through_fallthrough() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let conn = leading(&session);
        assert_eq!(conn.value(ParamKey::MaxBurstLength).unwrap(), ParamValue::Number(262_144));
        assert_eq!(conn.value(ParamKey::InitialR2T).unwrap(), ParamValue::Boolean(false));
    }

    #[test]
    fn test_missing_undefaulted_key_is_settings_error() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let conn = leading(&session);
        assert!(matches!(
            conn.value(ParamKey::TargetName),
            Err(IscsiError::Settings(_))
        ));
    }

    #[test]
    fn test_session_key_visible_to_later_connection() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut first = leading(&session);
        first.declare(ParamKey::TargetName, "iqn.example:disk0").unwrap();

        // a connection added to the session afterwards sees the value
        let second = ConnectionSettingsNegotiator::new(session.clone(), false);
        assert_eq!(
            second.value(ParamKey::TargetName).unwrap(),
            ParamValue::Text("iqn.example:disk0".to_string())
        );
    }

    #[test]
    fn test_connection_local_key_is_private() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut a = leading(&session);
        a.declare(ParamKey::MaxRecvDataSegmentLength, "4096").unwrap();

        let b = ConnectionSettingsNegotiator::new(session.clone(), false);
        // B never sees A's connection-local declaration, only the default
        assert_eq!(b.value(ParamKey::MaxRecvDataSegmentLength).unwrap(), ParamValue::Number(8192));
    }

    #[test]
    fn test_non_leading_cannot_write_session_keys() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut follower = ConnectionSettingsNegotiator::new(session.clone(), false);
        assert!(matches!(
            follower.declare(ParamKey::SessionType, "Discovery"),
            Err(IscsiError::Negotiation(_))
        ));
    }

    #[test]
    fn test_sealed_session_rejects_writes() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        conn.declare(ParamKey::SessionType, "Normal").unwrap();
        session.seal();
        assert!(matches!(
            conn.declare(ParamKey::TargetName, "iqn.example:late"),
            Err(IscsiError::Settings(_))
        ));
    }

    #[test]
    fn test_declare_guard_on_negotiated_key() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        assert!(matches!(
            conn.declare(ParamKey::MaxBurstLength, "1024"),
            Err(IscsiError::Negotiation(_))
        ));
    }

    #[test]
    fn test_negotiate_numeric_minimum() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        let agreed = conn.negotiate(ParamKey::MaxBurstLength, "131072").unwrap();
        assert_eq!(agreed, ParamValue::Number(131_072));
        // a larger proposal is capped at the target value
        let mut conn2 = leading(&session);
        let agreed = conn2.negotiate(ParamKey::FirstBurstLength, "1048576").unwrap();
        assert_eq!(agreed, ParamValue::Number(65_536));
    }

    #[test]
    fn test_negotiate_time2wait_maximum() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        assert_eq!(conn.negotiate(ParamKey::DefaultTime2Wait, "5").unwrap(), ParamValue::Number(5));
    }

    #[test]
    fn test_negotiate_boolean_and_or() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        // ImmediateData: AND with the target's Yes
        assert_eq!(conn.negotiate(ParamKey::ImmediateData, "No").unwrap(), ParamValue::Boolean(false));
        // InitialR2T: OR with the target's No
        assert_eq!(conn.negotiate(ParamKey::InitialR2T, "Yes").unwrap(), ParamValue::Boolean(true));
        assert_eq!(conn.negotiate(ParamKey::DataPduInOrder, "No").unwrap(), ParamValue::Boolean(true));
    }

    #[test]
    fn test_digest_list_selection() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        assert_eq!(
            conn.negotiate(ParamKey::HeaderDigest, "CRC32C,None").unwrap(),
            ParamValue::Text("None".to_string())
        );
        assert!(matches!(
            conn.negotiate(ParamKey::DataDigest, "CRC32C"),
            Err(IscsiError::Digest(_))
        ));
        assert!(matches!(
            conn.negotiate(ParamKey::AuthMethod, "SRP"),
            Err(IscsiError::Negotiation(_))
        ));
    }

    #[test]
    fn test_apply_unknown_key_not_understood() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        let reply = conn.apply("X-VendorFrobnicate", "Yes").unwrap();
        assert_eq!(reply, Some(("X-VendorFrobnicate".to_string(), "NotUnderstood".to_string())));
    }

    #[test]
    fn test_settings_snapshot() {
        let session = Arc::new(SessionSettingsNegotiator::new());
        let mut conn = leading(&session);
        conn.declare(ParamKey::InitiatorName, "iqn.example:host").unwrap();
        conn.declare(ParamKey::TargetName, "iqn.example:disk0").unwrap();
        conn.negotiate(ParamKey::MaxBurstLength, "131072").unwrap();

        let settings = conn.settings().unwrap();
        assert_eq!(settings.session_kind, SessionKind::Normal);
        assert_eq!(settings.target_name.as_deref(), Some("iqn.example:disk0"));
        assert_eq!(settings.max_burst_length, 131_072);
        assert_eq!(settings.header_digest, Digest::None);
        assert!(settings.immediate_data);
    }
}
