// src/config.rs

//! The daemon configuration model: the sectioned/keyed/positional config
//! file, its typed accessors, and the validated `Global` tunables.
//!
//! The file format is line oriented. `[SectionName]` opens a section, where
//! a trailing decimal suffix numbers it (`[PortalGroup1]`). Every other
//! non-comment line is an item: a key followed by whitespace-separated
//! values, with double quotes grouping a value that contains spaces.
//! Repeated keys are kept in order, which is what the `nval`/`nmval`
//! accessors index over.

use crate::core::TargetError;
use crate::core::limits::MAX_R2T;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONFIG: &str = "/usr/local/etc/rustgt/rustgt.conf";
pub const DEFAULT_PIDFILE: &str = "/var/run/rustgt.pid";
pub const DEFAULT_AUTHFILE: &str = "/usr/local/etc/rustgt/auth.conf";
pub const DEFAULT_MEDIADIRECTORY: &str = "/usr/local/rustgt";
pub const DEFAULT_NODEBASE: &str = "iqn.2016-04.org.rustgt";
pub const DEFAULT_LOG_FACILITY: &str = "daemon";

const DEFAULT_MAX_SESSIONS: u32 = 16;
const DEFAULT_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_MAX_OUTSTANDING_R2T: u32 = 16;
const DEFAULT_TIME2WAIT: u32 = 2;
const DEFAULT_TIME2RETAIN: u32 = 20;
const DEFAULT_FIRST_BURST_LENGTH: u32 = 262_144;
const DEFAULT_MAX_BURST_LENGTH: u32 = 1_048_576;
const DEFAULT_MAX_RECV_DATA_SEGMENT_LENGTH: u32 = 262_144;
const DEFAULT_TIMEOUT: u32 = 30;
const DEFAULT_NOPIN_INTERVAL: u32 = 20;
const DEFAULT_MAX_R2T: u32 = 16;

/// The section kinds the core recognizes. Anything else is retained as
/// `Unknown` so a foreign section does not break a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Global,
    PortalGroup,
    InitiatorGroup,
    UnitControl,
    LogicalUnit,
    AuthGroup,
    Unknown,
}

impl SectionKind {
    fn from_name(name: &str) -> SectionKind {
        const KNOWN: &[(&str, SectionKind)] = &[
            ("Global", SectionKind::Global),
            ("PortalGroup", SectionKind::PortalGroup),
            ("InitiatorGroup", SectionKind::InitiatorGroup),
            ("UnitControl", SectionKind::UnitControl),
            ("LogicalUnit", SectionKind::LogicalUnit),
            ("AuthGroup", SectionKind::AuthGroup),
        ];
        for (prefix, kind) in KNOWN {
            if name.eq_ignore_ascii_case(prefix) {
                return *kind;
            }
        }
        SectionKind::Unknown
    }
}

/// One occurrence of a key inside a section, with its positional values.
#[derive(Debug, Clone)]
struct Item {
    key: String,
    values: Vec<String>,
}

/// A parsed `[Name<N>]` block and its ordered items.
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    pub name: String,
    pub num: u32,
    items: Vec<Item>,
}

impl Section {
    /// The first value of the first occurrence of `key`.
    pub fn val(&self, key: &str) -> Option<&str> {
        self.nval(key, 0)
    }

    /// The first value of the `idx`-th occurrence of `key`.
    pub fn nval(&self, key: &str, idx: usize) -> Option<&str> {
        self.nmval(key, idx, 0)
    }

    /// The `col`-th space-separated value of the `idx`-th occurrence of `key`.
    pub fn nmval(&self, key: &str, idx: usize, col: usize) -> Option<&str> {
        self.items
            .iter()
            .filter(|item| item.key.eq_ignore_ascii_case(key))
            .nth(idx)
            .and_then(|item| item.values.get(col))
            .map(String::as_str)
    }

    /// Counts how many times `key` occurs in this section.
    pub fn count(&self, key: &str) -> usize {
        self.items
            .iter()
            .filter(|item| item.key.eq_ignore_ascii_case(key))
            .count()
    }
}

/// A fully tokenized configuration file. The path is retained so a reload
/// can re-read the same file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    sections: Vec<Section>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<ConfigFile, TargetError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| TargetError::ConfigFile(format!("{}: {e}", path.display())))?;
        ConfigFile::parse(&text, path)
    }

    pub fn parse(text: &str, path: impl Into<PathBuf>) -> Result<ConfigFile, TargetError> {
        let path = path.into();
        let mut sections: Vec<Section> = Vec::new();

        // Join '\'-continued lines before tokenizing.
        let mut logical = String::new();
        let mut lineno = 0usize;
        let mut lines: Vec<(usize, String)> = Vec::new();
        for raw in text.lines() {
            lineno += 1;
            if logical.is_empty() && raw.trim_start().starts_with('#') {
                continue;
            }
            if let Some(stripped) = raw.strip_suffix('\\') {
                logical.push_str(stripped);
                continue;
            }
            logical.push_str(raw);
            let line = std::mem::take(&mut logical);
            if !line.trim().is_empty() {
                lines.push((lineno, line));
            }
        }
        if !logical.trim().is_empty() {
            lines.push((lineno, logical));
        }

        for (lineno, line) in lines {
            let line = line.trim();
            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| {
                    TargetError::ConfigFile(format!(
                        "{}:{lineno}: unterminated section header",
                        path.display()
                    ))
                })?;
                let name = name.trim();
                let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
                let (prefix, num_text) = name.split_at(name.len() - digits);
                let num = if num_text.is_empty() {
                    0
                } else {
                    num_text.parse::<u32>().map_err(|_| {
                        TargetError::ConfigFile(format!(
                            "{}:{lineno}: bad section number '{name}'",
                            path.display()
                        ))
                    })?
                };
                sections.push(Section {
                    kind: SectionKind::from_name(prefix),
                    name: name.to_string(),
                    num,
                    items: Vec::new(),
                });
                continue;
            }

            let mut words = split_values(line, &path, lineno)?;
            if words.is_empty() {
                continue;
            }
            let key = words.remove(0);
            let section = sections.last_mut().ok_or_else(|| {
                TargetError::ConfigFile(format!(
                    "{}:{lineno}: item '{key}' outside of any section",
                    path.display()
                ))
            })?;
            section.items.push(Item { key, values: words });
        }

        Ok(ConfigFile { path, sections })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn sections_of(&self, kind: SectionKind) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(move |s| s.kind == kind)
    }

    /// Finds a section by its full name, case-insensitively.
    pub fn find(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// True if a `kind` section numbered `num` exists. This is what reload
    /// uses to decide whether a live group has been retired.
    pub fn has_numbered(&self, kind: SectionKind, num: u32) -> bool {
        self.sections
            .iter()
            .any(|s| s.kind == kind && s.num == num)
    }
}

/// Splits an item line into words, grouping double-quoted runs.
fn split_values(line: &str, path: &Path, lineno: usize) -> Result<Vec<String>, TargetError> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut word = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                word.push(c);
            }
            if !closed {
                return Err(TargetError::ConfigFile(format!(
                    "{}:{lineno}: unterminated quote",
                    path.display()
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
        }
        out.push(word);
    }
    Ok(out)
}

/// Discovery-session authentication policy, decoded from
/// `DiscoveryAuthMethod` / `DiscoveryAuthGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscoveryAuth {
    /// `None` was listed: discovery runs unauthenticated.
    pub no_auth: bool,
    /// `CHAP` was listed: CHAP is required.
    pub require_chap: bool,
    /// `Mutual` was listed: mutual CHAP is required.
    pub require_mutual: bool,
    /// Tag of the `AuthGroup<N>` holding the discovery secrets, 0 = none.
    pub auth_group: u32,
}

/// Daemon-wide tunables read from the `[Global]` section. Read once at init
/// and once per reload; a reload that fails validation leaves the previous
/// values in force.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub node_base: String,
    pub pidfile: PathBuf,
    pub authfile: PathBuf,
    pub media_directory: PathBuf,
    pub log_facility: String,
    pub max_sessions: u32,
    pub max_connections: u32,
    pub max_outstanding_r2t: u32,
    pub default_time2wait: u32,
    pub default_time2retain: u32,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub max_recv_data_segment_length: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u32,
    pub timeout: u32,
    pub nopin_interval: u32,
    pub max_r2t: u32,
    pub discovery_auth: DiscoveryAuth,
}

impl Tunables {
    /// Reads and validates the `[Global]` section. Missing keys take their
    /// defaults; out-of-range or unsupported values are fatal.
    pub fn from_config(config: &ConfigFile) -> Result<Tunables, TargetError> {
        let sp = config
            .find("Global")
            .ok_or_else(|| TargetError::ConfigInvalid("no [Global] section".into()))?;

        if let Some(comment) = sp.val("Comment") {
            debug!("Comment {comment}");
        }

        let node_base = sp.val("NodeBase").unwrap_or(DEFAULT_NODEBASE).to_string();
        let pidfile = PathBuf::from(sp.val("PidFile").unwrap_or(DEFAULT_PIDFILE));
        let authfile = PathBuf::from(sp.val("AuthFile").unwrap_or(DEFAULT_AUTHFILE));
        let media_directory =
            PathBuf::from(sp.val("MediaDirectory").unwrap_or(DEFAULT_MEDIADIRECTORY));
        let log_facility = sp
            .val("LogFacility")
            .unwrap_or(DEFAULT_LOG_FACILITY)
            .to_string();

        let max_sessions = int_floor(sp, "MaxSessions", 1, DEFAULT_MAX_SESSIONS)?;
        let max_connections = int_floor(sp, "MaxConnections", 1, DEFAULT_MAX_CONNECTIONS)?;
        // Session and connection counts are 16-bit on the wire (RFC 3720, 12.2).
        if max_sessions > 0xffff {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxSessions({max_sessions}) > 65535"
            )));
        }
        if max_connections > 0xffff {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxConnections({max_connections}) > 65535"
            )));
        }

        let max_outstanding_r2t =
            int_floor(sp, "MaxOutstandingR2T", 1, DEFAULT_MAX_OUTSTANDING_R2T)?;
        if max_outstanding_r2t > 0xffff {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxOutstandingR2T({max_outstanding_r2t}) > 65535"
            )));
        }

        let default_time2wait = int_floor(sp, "DefaultTime2Wait", 0, DEFAULT_TIME2WAIT)?;
        let default_time2retain = int_floor(sp, "DefaultTime2Retain", 0, DEFAULT_TIME2RETAIN)?;
        if default_time2wait > 3600 {
            return Err(TargetError::ConfigInvalid(format!(
                "DefaultTime2Wait({default_time2wait}) > 3600"
            )));
        }
        if default_time2retain > 3600 {
            return Err(TargetError::ConfigInvalid(format!(
                "DefaultTime2Retain({default_time2retain}) > 3600"
            )));
        }

        let first_burst_length = int_floor(sp, "FirstBurstLength", 0, DEFAULT_FIRST_BURST_LENGTH)?;
        let max_burst_length = int_floor(sp, "MaxBurstLength", 0, DEFAULT_MAX_BURST_LENGTH)?;
        let max_recv_data_segment_length = int_floor(
            sp,
            "MaxRecvDataSegmentLength",
            0,
            DEFAULT_MAX_RECV_DATA_SEGMENT_LENGTH,
        )?;
        // Burst and segment lengths are 24-bit (RFC 3720, 12.12-12.17).
        if max_burst_length < 512 {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxBurstLength({max_burst_length}) < 512"
            )));
        }
        if first_burst_length < 512 {
            return Err(TargetError::ConfigInvalid(format!(
                "FirstBurstLength({first_burst_length}) < 512"
            )));
        }
        if first_burst_length > max_burst_length {
            return Err(TargetError::ConfigInvalid(format!(
                "FirstBurstLength({first_burst_length}) > MaxBurstLength({max_burst_length})"
            )));
        }
        if max_burst_length > 0x00ff_ffff {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxBurstLength({max_burst_length}) > 0x00ffffff"
            )));
        }
        if max_recv_data_segment_length < 512 {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxRecvDataSegmentLength({max_recv_data_segment_length}) < 512"
            )));
        }
        if max_recv_data_segment_length > 0x00ff_ffff {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxRecvDataSegmentLength({max_recv_data_segment_length}) > 0x00ffffff"
            )));
        }

        let initial_r2t = required_yes(sp, "InitialR2T")?;
        let immediate_data = yes_no(sp, "ImmediateData", true)?;
        let data_pdu_in_order = required_yes(sp, "DataPDUInOrder")?;
        let data_sequence_in_order = required_yes(sp, "DataSequenceInOrder")?;

        let error_recovery_level = match int_opt(sp, "ErrorRecoveryLevel")? {
            None => 0,
            Some(0) => 0,
            Some(n) => {
                return Err(TargetError::ConfigInvalid(format!(
                    "ErrorRecoveryLevel {n} is not supported"
                )));
            }
        };

        let timeout = int_floor(sp, "Timeout", 0, DEFAULT_TIMEOUT)?;
        let nopin_interval = int_floor(sp, "NopInInterval", 0, DEFAULT_NOPIN_INTERVAL)?;

        let max_r2t = int_floor(sp, "MaxR2T", 0, DEFAULT_MAX_R2T)?;
        if max_r2t > MAX_R2T {
            return Err(TargetError::ConfigInvalid(format!(
                "MaxR2T({max_r2t}) > {MAX_R2T}"
            )));
        }

        let discovery_auth = parse_discovery_auth(sp)?;

        Ok(Tunables {
            node_base,
            pidfile,
            authfile,
            media_directory,
            log_facility,
            max_sessions,
            max_connections,
            max_outstanding_r2t,
            default_time2wait,
            default_time2retain,
            first_burst_length,
            max_burst_length,
            max_recv_data_segment_length,
            initial_r2t,
            immediate_data,
            data_pdu_in_order,
            data_sequence_in_order,
            error_recovery_level,
            timeout,
            nopin_interval,
            max_r2t,
            discovery_auth,
        })
    }
}

/// An integer tunable: `None` when the key is missing, an error when the
/// value does not parse as a decimal integer.
fn int_opt(sp: &Section, key: &str) -> Result<Option<i64>, TargetError> {
    match sp.val(key) {
        None => Ok(None),
        Some(text) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| TargetError::ConfigInvalid(format!("{key}: bad integer '{text}'"))),
    }
}

/// An integer tunable where values below `floor` fall back to the default.
fn int_floor(sp: &Section, key: &str, floor: i64, default: u32) -> Result<u32, TargetError> {
    match int_opt(sp, key)? {
        Some(n) if n >= floor => Ok(n as u32),
        _ => Ok(default),
    }
}

/// A Yes/No tunable.
fn yes_no(sp: &Section, key: &str, default: bool) -> Result<bool, TargetError> {
    match sp.val(key) {
        None => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("Yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("No") => Ok(false),
        Some(v) => Err(TargetError::ConfigInvalid(format!(
            "{key}: unknown value {v}"
        ))),
    }
}

/// A tunable the negotiation engine only supports as `Yes`: `No` parses but
/// is rejected.
fn required_yes(sp: &Section, key: &str) -> Result<bool, TargetError> {
    match sp.val(key) {
        None => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("Yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("No") => Err(TargetError::ConfigInvalid(format!(
            "{key}: not supported value {v}"
        ))),
        Some(v) => Err(TargetError::ConfigInvalid(format!(
            "{key}: unknown value {v}"
        ))),
    }
}

fn parse_discovery_auth(sp: &Section) -> Result<DiscoveryAuth, TargetError> {
    let mut auth = DiscoveryAuth::default();

    if sp.val("DiscoveryAuthMethod").is_some() {
        let mut col = 0;
        while let Some(word) = sp.nmval("DiscoveryAuthMethod", 0, col) {
            if word.eq_ignore_ascii_case("CHAP") {
                auth.require_chap = true;
            } else if word.eq_ignore_ascii_case("Mutual") {
                auth.require_mutual = true;
            } else if word.eq_ignore_ascii_case("Auto") {
                auth.require_chap = false;
                auth.require_mutual = false;
            } else if word.eq_ignore_ascii_case("None") {
                auth.no_auth = true;
                auth.require_chap = false;
                auth.require_mutual = false;
            } else {
                return Err(TargetError::ConfigInvalid(format!(
                    "DiscoveryAuthMethod: unknown auth '{word}'"
                )));
            }
            col += 1;
        }
        if auth.require_mutual && !auth.require_chap {
            return Err(TargetError::ConfigInvalid(
                "DiscoveryAuthMethod: Mutual requires CHAP".into(),
            ));
        }
    }

    if let Some(tag_text) = sp.val("DiscoveryAuthGroup") {
        if tag_text.eq_ignore_ascii_case("None") {
            auth.auth_group = 0;
        } else {
            let num = tag_text
                .strip_prefix("AuthGroup")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| {
                    TargetError::ConfigInvalid(format!(
                        "DiscoveryAuthGroup: bad group '{tag_text}'"
                    ))
                })?;
            if num == 0 {
                return Err(TargetError::ConfigInvalid(
                    "DiscoveryAuthGroup: group 0 is invalid".into(),
                ));
            }
            auth.auth_group = num;
        }
    }

    Ok(auth)
}

/// Syslog facility names the `-l` flag and the `LogFacility` key accept.
/// Structured logging replaced syslog itself, but the set is still
/// validated so a typo fails loudly instead of being carried around.
pub fn valid_log_facility(name: &str) -> bool {
    const FACILITIES: &[&str] = &[
        "daemon", "auth", "authpriv", "local0", "local1", "local2", "local3", "local4", "local5",
        "local6", "local7",
    ];
    FACILITIES.iter().any(|f| name.eq_ignore_ascii_case(f))
}
