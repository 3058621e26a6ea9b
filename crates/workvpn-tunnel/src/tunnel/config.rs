//! `.ovpn` text parsing, validation and generation.

use crate::tunnel::types::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use workvpn_core::{VpnError, VpnResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hard parse failure; the text cannot be turned into a config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `<name>` opened but never closed.
    UnterminatedBlock(String),
    MissingArgument(String),
    InvalidValue { directive: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnterminatedBlock(name) => {
                write!(f, "inline block <{name}> is never closed")
            }
            ConfigError::MissingArgument(d) => write!(f, "directive '{d}' needs an argument"),
            ConfigError::InvalidValue { directive, value } => {
                write!(f, "invalid value '{value}' for directive '{directive}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for VpnError {
    fn from(e: ConfigError) -> Self {
        VpnError::invalid_config(e.to_string())
    }
}

/// Reason a parsed config is not connectable. Reported as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    MissingRemote,
    MissingCertificateAuthority,
    PortOutOfRange { port: i64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRemote => write!(f, "missing remote server address"),
            ValidationError::MissingCertificateAuthority => {
                write!(f, "missing CA certificate (<ca> block or ca directive)")
            }
            ValidationError::PortOutOfRange { port } => {
                write!(f, "remote port {port} is outside 1-65535")
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parsing (.ovpn → TunnelConfig)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<(/?)([\w-]+)>$").ok()).as_ref()
}

/// Returns `(closing, name)` if the trimmed line is a block tag.
fn block_tag(line: &str) -> Option<(bool, &str)> {
    let caps = tag_regex()?.captures(line)?;
    let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);
    let name = caps.get(2)?.as_str();
    Some((closing, name))
}

/// Parse config text.
pub fn parse(text: &str) -> Result<TunnelConfig, ConfigError> {
    let mut cfg = TunnelConfig::default();
    let mut seen_remote = false;
    let mut remote_proto = false;
    let mut block: Option<(String, Vec<&str>)> = None;

    for raw in text.lines() {
        let line = raw.trim();

        // Inside an inline block everything up to the matching close tag
        // is payload.
        if let Some((name, buf)) = block.as_mut() {
            if let Some((true, closing)) = block_tag(line) {
                if closing == name.as_str() {
                    cfg.inline_blocks.insert(name.clone(), buf.join("\n"));
                    block = None;
                    continue;
                }
            }
            if !line.is_empty() {
                buf.push(raw.trim_end());
            }
            continue;
        }

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some((closing, name)) = block_tag(line) {
            if !closing {
                block = Some((name.to_string(), Vec::new()));
            }
            continue;
        }

        let mut tokens = line.split_whitespace();
        let keyword = match tokens.next() {
            Some(k) => k,
            None => continue,
        };
        let args: Vec<&str> = tokens.collect();

        match keyword.to_ascii_lowercase().as_str() {
            "remote" if !seen_remote => {
                let host = args
                    .first()
                    .ok_or_else(|| ConfigError::MissingArgument("remote".into()))?;
                cfg.remote_host = host.to_string();
                if let Some(port) = args.get(1) {
                    cfg.remote_port = parse_port(port).ok_or_else(|| invalid("remote", port))?;
                }
                if let Some(proto) = args.get(2) {
                    cfg.transport = Some(
                        TransportProto::from_str_loose(proto).ok_or_else(|| invalid("remote", proto))?,
                    );
                    remote_proto = true;
                }
                seen_remote = true;
            }
            "proto" => {
                let p = first_arg("proto", &args)?;
                // Last one wins, unless the primary remote line named a proto.
                let parsed =
                    TransportProto::from_str_loose(p).ok_or_else(|| invalid("proto", p))?;
                if !remote_proto {
                    cfg.transport = Some(parsed);
                }
            }
            "dev" => {
                let d = first_arg("dev", &args)?;
                let kind = DeviceKind::from_str_loose(d).ok_or_else(|| invalid("dev", d))?;
                cfg.device = Some(kind);
                cfg.device_name = if d.eq_ignore_ascii_case(&kind.to_string()) {
                    None
                } else {
                    Some(d.to_string())
                };
            }
            "cipher" => cfg.cipher = Some(first_arg("cipher", &args)?.to_string()),
            "auth" => cfg.auth = Some(first_arg("auth", &args)?.to_string()),
            "key-direction" => {
                let v = first_arg("key-direction", &args)?;
                let dir: u8 = v.parse().map_err(|_| invalid("key-direction", v))?;
                if dir > 1 {
                    return Err(invalid("key-direction", v));
                }
                cfg.key_direction = Some(dir);
            }
            _ => cfg.extra_directives.push(Directive::new(
                keyword,
                args.iter().map(|a| a.to_string()).collect(),
            )),
        }
    }

    if let Some((name, _)) = block {
        return Err(ConfigError::UnterminatedBlock(name));
    }
    Ok(cfg)
}

/// Numeric port text, saturating on overflow so range checks stay with
/// [`validate`]. `None` only for text that is not a number at all.
fn parse_port(text: &str) -> Option<i64> {
    if let Ok(port) = text.parse::<i64>() {
        return Some(port);
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(if negative { i64::MIN } else { i64::MAX })
}

fn first_arg<'a>(directive: &str, args: &[&'a str]) -> Result<&'a str, ConfigError> {
    args.first()
        .copied()
        .ok_or_else(|| ConfigError::MissingArgument(directive.to_string()))
}

fn invalid(directive: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        directive: directive.to_string(),
        value: value.to_string(),
    }
}

/// Read and parse a config file. The name is the file stem.
pub fn load_file(path: &Path) -> VpnResult<(String, TunnelConfig)> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        VpnError::invalid_config(format!("cannot read config {}", path.display()))
            .with_detail(e.to_string())
    })?;
    let cfg = parse(&text)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "imported".to_string());
    log::debug!("loaded config '{name}' ({}:{})", cfg.remote_host, cfg.remote_port);
    Ok((name, cfg))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything that makes `cfg` unusable for a connect. Empty means valid.
pub fn validate(cfg: &TunnelConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if cfg.remote_host.trim().is_empty() {
        errors.push(ValidationError::MissingRemote);
    }
    if !cfg.has_certificate_authority() {
        errors.push(ValidationError::MissingCertificateAuthority);
    }
    if !(1..=65535).contains(&cfg.remote_port) {
        errors.push(ValidationError::PortOutOfRange {
            port: cfg.remote_port,
        });
    }
    errors
}

/// Soft issues worth showing but not blocking a connect.
pub fn warnings(cfg: &TunnelConfig) -> Vec<String> {
    let mut out = Vec::new();
    if cfg.device.is_none() {
        out.push("no device type specified (should be tun or tap)".to_string());
    }
    if cfg.transport.is_none() {
        out.push("no protocol specified, udp will be used".to_string());
    }
    if cfg
        .extra_directives
        .iter()
        .any(|d| d.is("auth-user-pass") && !d.args.is_empty())
    {
        out.push("auth-user-pass file is ignored, credentials are prompted".to_string());
    }
    out
}

/// Join validation errors into a single reason string.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Generation (TunnelConfig → .ovpn text)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emit config text for exactly the fields present in `cfg`.
pub fn generate(cfg: &TunnelConfig) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(name) = &cfg.device_name {
        lines.push(format!("dev {}", name));
    } else if let Some(dev) = cfg.device {
        lines.push(format!("dev {}", dev));
    }
    if let Some(proto) = cfg.transport {
        lines.push(format!("proto {}", proto));
    }
    if !cfg.remote_host.is_empty() {
        lines.push(format!("remote {} {}", cfg.remote_host, cfg.remote_port));
    }
    if let Some(c) = &cfg.cipher {
        lines.push(format!("cipher {}", c));
    }
    if let Some(a) = &cfg.auth {
        lines.push(format!("auth {}", a));
    }
    if let Some(k) = cfg.key_direction {
        lines.push(format!("key-direction {}", k));
    }
    for d in &cfg.extra_directives {
        lines.push(d.to_string());
    }
    for (name, body) in &cfg.inline_blocks {
        lines.push(format!("<{}>", name));
        if !body.is_empty() {
            lines.push(body.clone());
        }
        lines.push(format!("</{}>", name));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "remote vpn.example.com 1194\nproto udp\n<ca>\nX\n</ca>";

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_minimal_sample() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.remote_host, "vpn.example.com");
        assert_eq!(cfg.remote_port, 1194);
        assert_eq!(cfg.transport, Some(TransportProto::Udp));
        assert_eq!(cfg.inline_blocks.get("ca").map(String::as_str), Some("X"));
        assert_eq!(cfg.inline_blocks.len(), 1);
        assert!(validate(&cfg).is_empty());
    }

    #[test]
    fn parse_default_port() {
        let cfg = parse("remote vpn.example.com").unwrap();
        assert_eq!(cfg.remote_port, 1194);
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "# comment\n; other\n\nremote a.example 443\n";
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.remote_host, "a.example");
        assert!(cfg.extra_directives.is_empty());
    }

    #[test]
    fn parse_recognised_directives() {
        let text = "client\ndev tun0\nproto tcp-client\nremote h 443\ncipher AES-256-GCM\nauth SHA256\nkey-direction 1\n";
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.device, Some(DeviceKind::Tun));
        assert_eq!(cfg.device_name.as_deref(), Some("tun0"));
        assert_eq!(cfg.transport, Some(TransportProto::Tcp));
        assert_eq!(cfg.cipher.as_deref(), Some("AES-256-GCM"));
        assert_eq!(cfg.auth.as_deref(), Some("SHA256"));
        assert_eq!(cfg.key_direction, Some(1));
        assert_eq!(cfg.extra_directives, vec![Directive::new("client", vec![])]);
    }

    #[test]
    fn parse_remote_proto_overrides_proto_line() {
        let cfg = parse("proto udp\nremote h 443 tcp\n").unwrap();
        assert_eq!(cfg.transport, Some(TransportProto::Tcp));
        let cfg = parse("remote h 443 tcp\nproto udp\n").unwrap();
        assert_eq!(cfg.transport, Some(TransportProto::Tcp));
    }

    #[test]
    fn parse_last_proto_line_wins() {
        let cfg = parse("proto udp\nremote h 1194\nproto tcp\n<ca>\nX\n</ca>").unwrap();
        assert_eq!(cfg.transport, Some(TransportProto::Tcp));
        assert!(generate(&cfg).contains("proto tcp\n"));
        assert!(!generate(&cfg).contains("proto udp"));
    }

    #[test]
    fn parse_additional_remotes_are_kept() {
        let cfg = parse("remote a.example 1194\nremote b.example 443\n").unwrap();
        assert_eq!(cfg.remote_host, "a.example");
        let extra = cfg.directive("remote").unwrap();
        assert_eq!(extra.args, vec!["b.example".to_string(), "443".to_string()]);
    }

    #[test]
    fn parse_unknown_directives_preserved() {
        let cfg = parse("remote-cert-tls server\nauth-user-pass\n").unwrap();
        assert_eq!(cfg.extra_directives.len(), 2);
        assert!(cfg.requires_auth());
    }

    #[test]
    fn parse_multiline_blocks() {
        let text = "<cert>\n-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n</cert>\n<tls-auth>\n# 2048 bit key\nabcd\n</tls-auth>\n";
        let cfg = parse(text).unwrap();
        assert_eq!(
            cfg.inline_blocks["cert"],
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----"
        );
        assert_eq!(cfg.inline_blocks["tls-auth"], "# 2048 bit key\nabcd");
    }

    #[test]
    fn parse_block_ignores_foreign_close_tag() {
        let cfg = parse("<ca>\nX\n</cert>\nY\n</ca>\n").unwrap();
        assert_eq!(cfg.inline_blocks["ca"], "X\n</cert>\nY");
    }

    #[test]
    fn parse_unterminated_block_fails() {
        let err = parse("<ca>\nX\n").unwrap_err();
        assert_eq!(err, ConfigError::UnterminatedBlock("ca".into()));
    }

    #[test]
    fn parse_bad_values() {
        assert!(matches!(
            parse("remote h notaport"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse("proto sctp"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse("remote"),
            Err(ConfigError::MissingArgument(_))
        ));
        assert!(matches!(
            parse("key-direction 4"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parse_crlf_line_endings() {
        let cfg = parse("remote h 1194\r\n<ca>\r\nX\r\n</ca>\r\n").unwrap();
        assert_eq!(cfg.inline_blocks["ca"], "X");
    }

    // ── Validation ───────────────────────────────────────────────

    #[test]
    fn validate_reports_each_problem() {
        let cfg = TunnelConfig {
            remote_port: 70000,
            ..Default::default()
        };
        let errors = validate(&cfg);
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::MissingRemote));
        assert!(errors.contains(&ValidationError::MissingCertificateAuthority));
        assert!(errors.contains(&ValidationError::PortOutOfRange { port: 70000 }));
    }

    #[test]
    fn validate_missing_remote_mentions_remote() {
        let cfg = parse("<ca>\nX\n</ca>").unwrap();
        let errors = validate(&cfg);
        assert!(!errors.is_empty());
        assert!(describe(&errors).contains("remote"));
    }

    #[test]
    fn out_of_range_ports_reach_validation() {
        let cfg = parse("remote h -1\n<ca>\nX\n</ca>").unwrap();
        assert_eq!(validate(&cfg), vec![ValidationError::PortOutOfRange { port: -1 }]);

        let cfg = parse("remote h 99999999999\n<ca>\nX\n</ca>").unwrap();
        assert_eq!(
            validate(&cfg),
            vec![ValidationError::PortOutOfRange { port: 99999999999 }]
        );

        let cfg = parse("remote h 999999999999999999999999\n").unwrap();
        assert_eq!(cfg.remote_port, i64::MAX);
        assert_eq!(validate(&cfg).len(), 2);
        assert!(describe(&validate(&cfg)).contains("outside 1-65535"));
    }

    #[test]
    fn validate_port_zero() {
        let cfg = parse("remote h 0\n<ca>\nX\n</ca>").unwrap();
        assert_eq!(validate(&cfg), vec![ValidationError::PortOutOfRange { port: 0 }]);
    }

    #[test]
    fn warnings_for_missing_dev_and_auth_file() {
        let cfg = parse("remote h\nauth-user-pass /etc/creds.txt\n").unwrap();
        let w = warnings(&cfg);
        assert!(w.iter().any(|s| s.contains("device")));
        assert!(w.iter().any(|s| s.contains("auth-user-pass")));
    }

    // ── Generation ───────────────────────────────────────────────

    #[test]
    fn generate_roundtrip() {
        let text = "client\ndev tun\nproto tcp\nremote vpn.example.com 443\ncipher AES-256-GCM\nauth SHA512\nkey-direction 1\nremote-cert-tls server\n<ca>\nCA-DATA\n</ca>\n<tls-auth>\nTA\n</tls-auth>\n";
        let first = parse(text).unwrap();
        let second = parse(&generate(&first)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generate_roundtrip_sample() {
        let first = parse(SAMPLE).unwrap();
        let generated = generate(&first);
        assert!(generated.contains("remote vpn.example.com 1194"));
        assert!(generated.contains("<ca>\nX\n</ca>"));
        assert_eq!(parse(&generated).unwrap(), first);
    }

    #[test]
    fn generate_omits_absent_fields() {
        let text = generate(&TunnelConfig::default());
        assert!(!text.contains("remote"));
        assert!(!text.contains("proto"));
        assert!(!text.contains("cipher"));
    }

    #[test]
    fn generate_keeps_device_name() {
        let cfg = parse("dev tap-office\n").unwrap();
        assert!(generate(&cfg).contains("dev tap-office"));
    }

    // ── Files ────────────────────────────────────────────────────

    #[test]
    fn load_file_uses_stem_as_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("office.ovpn");
        std::fs::write(&path, SAMPLE).unwrap();
        let (name, cfg) = load_file(&path).unwrap();
        assert_eq!(name, "office");
        assert_eq!(cfg.remote_host, "vpn.example.com");
    }

    #[test]
    fn load_file_missing_is_invalid_config() {
        let err = load_file(Path::new("/nonexistent/none.ovpn")).unwrap_err();
        assert_eq!(err.kind, workvpn_core::VpnErrorKind::InvalidConfig);
    }
}
