//! Input validation for operator-supplied names.
//!
//! Names end up in shell command lines, wg-quick config files and the
//! frontend, so the safe-name check is deliberately strict about anything
//! that could escape those contexts.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,

    #[error("name contains null byte")]
    NullByte,

    #[error("name too long: got {0} bytes, max allowed is 128")]
    TooLong(usize),

    #[error("name uses reserved name {0:?}")]
    Reserved(&'static str),

    #[error("name contains path traversal sequence '..'")]
    PathTraversal,

    #[error("name contains path separators")]
    PathSeparator,

    #[error("name contains shell special characters")]
    ShellCharacter,

    #[error("name contains control character at byte {0}")]
    ControlCharacter(usize),

    #[error("name contains invisible or bidirectional character at byte {0}")]
    InvisibleCharacter(usize),

    #[error("name contains HTML angle brackets")]
    AngleBracket,

    #[error("name has leading or trailing whitespace")]
    EdgeWhitespace,

    #[error("name ends with dot")]
    TrailingDot,

    #[error("interface name must start with prefix {0:?}")]
    MissingPrefix(String),

    #[error("interface name {0:?} is too long: max allowed is 15 characters")]
    IfnameTooLong(String),

    #[error("interface name {0:?} contains invalid characters")]
    IfnameInvalid(String),

    #[error("{0:?} is not a valid IP address or domain name")]
    NotIpOrDomain(String),
}

const RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const SHELL_SPECIAL: &str = "|&;`$(){}[]<>\"'*?~";

/// Validate a server or client name for use in shell commands, file names
/// and the frontend. International characters are allowed; control,
/// invisible, bidirectional-override and zero-width characters are not.
pub fn is_safe_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.contains('\0') {
        return Err(NameError::NullByte);
    }
    if name.len() > 128 {
        return Err(NameError::TooLong(name.len()));
    }

    let upper = name.trim().to_uppercase();
    for reserved in RESERVED {
        if upper == *reserved || upper.starts_with(&format!("{reserved}.")) {
            return Err(NameError::Reserved(reserved));
        }
    }

    if name.contains("..") {
        return Err(NameError::PathTraversal);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(NameError::PathSeparator);
    }
    if name.chars().any(|c| SHELL_SPECIAL.contains(c)) {
        return Err(NameError::ShellCharacter);
    }

    for (i, c) in name.char_indices() {
        if c.is_control() && c != '\t' {
            return Err(NameError::ControlCharacter(i));
        }
        // Bidirectional overrides and isolates, used in spoofing.
        if ('\u{202A}'..='\u{202E}').contains(&c) || ('\u{2066}'..='\u{2069}').contains(&c) {
            return Err(NameError::InvisibleCharacter(i));
        }
        // Zero-width characters.
        if matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}') {
            return Err(NameError::InvisibleCharacter(i));
        }
    }

    if name.contains('<') || name.contains('>') {
        return Err(NameError::AngleBracket);
    }
    if name.trim() != name {
        return Err(NameError::EdgeWhitespace);
    }
    if name.ends_with('.') {
        return Err(NameError::TrailingDot);
    }

    Ok(())
}

/// Validate a managed WireGuard interface name: must carry the configured
/// prefix, at most 15 characters, `[A-Za-z0-9_-]` only.
pub fn validate_ifname(prefix: &str, ifname: &str) -> Result<(), NameError> {
    if !ifname.starts_with(prefix) {
        return Err(NameError::MissingPrefix(prefix.to_owned()));
    }
    if ifname.len() > 15 {
        return Err(NameError::IfnameTooLong(ifname.to_owned()));
    }
    if ifname.is_empty()
        || !ifname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(NameError::IfnameInvalid(ifname.to_owned()));
    }
    Ok(())
}

/// Validate a physical (upstream) interface name: `[A-Za-z0-9._@-]`, at
/// most 15 characters.
pub fn validate_phys_ifname(ifname: &str) -> Result<(), NameError> {
    if ifname.is_empty() {
        return Err(NameError::Empty);
    }
    if ifname.chars().count() > 15 {
        return Err(NameError::IfnameTooLong(ifname.to_owned()));
    }
    if !ifname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'))
    {
        return Err(NameError::IfnameInvalid(ifname.to_owned()));
    }
    Ok(())
}

/// Basic RFC-1035-shaped domain validation: dot-separated labels of at most
/// 63 characters, alphanumeric with interior hyphens, 253 characters total.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// DNS entries may be IP addresses or domain names.
pub fn validate_ip_or_domain(value: &str) -> Result<(), NameError> {
    if value.parse::<std::net::IpAddr>().is_ok() || is_valid_domain(value) {
        return Ok(());
    }
    Err(NameError::NotIpOrDomain(value.to_owned()))
}

/// Validate and normalize an interface endpoint: a v4 address, a v6 address
/// (returned bracketed), or a domain name.
pub fn validate_endpoint(endpoint: &str) -> Result<String, NameError> {
    if endpoint.is_empty() {
        return Err(NameError::Empty);
    }
    let bare = if endpoint.len() > 2 && endpoint.starts_with('[') && endpoint.ends_with(']') {
        &endpoint[1..endpoint.len() - 1]
    } else {
        endpoint
    };

    if let Ok(addr) = bare.parse::<std::net::IpAddr>() {
        return Ok(match addr {
            std::net::IpAddr::V4(_) => bare.to_owned(),
            std::net::IpAddr::V6(_) => format!("[{bare}]"),
        });
    }
    if is_valid_domain(bare) {
        return Ok(bare.to_owned());
    }
    Err(NameError::NotIpOrDomain(endpoint.to_owned()))
}
