//! Channel name parsing
//!
//! Channel names look like `SIP/100-0000002a`, `PJSIP/100-0000002a` or
//! `Local/FMPR-100@from-internal-0000002b;1`. Nothing here fails: input that
//! does not match a known shape simply yields `None`.

/// Virtual-channel prefixes wrapping a real extension, with the number of
/// characters to skip
const VIRTUAL_PREFIXES: [(&str, usize); 3] = [("FMPR", 5), ("FMGL", 5), ("LC", 3)];

const ZOMBIE_MARKER: &str = "<ZOMBIE>";

/// Numeric directory number, optionally with a leading `+`
pub fn is_numeric(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Raw peer part of a channel name, numeric or not.
///
/// `SIP/trunk-0001` yields `trunk`; callers that need a directory number
/// use [`extract_extension`].
pub fn extract_peer(channel: &str) -> Option<String> {
    let peer = if let Some(rest) = channel
        .strip_prefix("SIP/")
        .or_else(|| channel.strip_prefix("PJSIP/"))
    {
        match rest.rfind('-') {
            Some(pos) => &rest[..pos],
            None => rest,
        }
    } else if let Some(rest) = channel.strip_prefix("Local/") {
        let inner = rest.split('@').next().unwrap_or(rest);
        if is_numeric(inner) {
            return Some(inner.to_string());
        }
        strip_virtual_prefix(inner)?
    } else if is_numeric(channel) {
        return Some(channel.to_string());
    } else {
        strip_virtual_prefix(channel)?
    };

    Some(truncate_sub_context(peer).to_string())
}

/// Directory number behind a channel name, or a bare number passed through
pub fn extract_extension(channel: &str) -> Option<String> {
    extract_peer(channel).filter(|peer| is_numeric(peer))
}

/// Per-physical-channel correlation key: the text after the last `-`, up to
/// a `;` or zombie marker
pub fn extract_channel_key(channel: &str) -> Option<String> {
    let start = channel.rfind('-')? + 1;
    let tail = &channel[start..];
    let end = tail
        .find(';')
        .or_else(|| tail.find(ZOMBIE_MARKER))
        .unwrap_or(tail.len());

    Some(tail[..end].to_string())
}

fn strip_virtual_prefix(s: &str) -> Option<&str> {
    VIRTUAL_PREFIXES
        .iter()
        .find(|(prefix, _)| s.starts_with(prefix))
        .map(|&(_, skip)| s.get(skip..).unwrap_or(""))
}

fn truncate_sub_context(s: &str) -> &str {
    match s.find('#') {
        Some(pos) if pos > 0 => &s[..pos],
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_channels() {
        assert_eq!(extract_extension("SIP/100-0000002a").as_deref(), Some("100"));
        assert_eq!(extract_extension("PJSIP/2001-00000001").as_deref(), Some("2001"));
        assert_eq!(extract_peer("SIP/trunk-00000003").as_deref(), Some("trunk"));
        assert_eq!(extract_extension("SIP/trunk-00000003"), None);
    }

    #[test]
    fn test_local_channels() {
        assert_eq!(
            extract_extension("Local/300@from-internal-00000004;1").as_deref(),
            Some("300")
        );
        assert_eq!(
            extract_extension("Local/FMPR-200@from-internal-00000005;2").as_deref(),
            Some("200")
        );
        assert_eq!(
            extract_extension("Local/FMGL-201#@from-internal-00000006;1").as_deref(),
            Some("201")
        );
        assert_eq!(
            extract_extension("Local/LC-202@from-internal-00000007;1").as_deref(),
            Some("202")
        );
        assert_eq!(extract_extension("Local/ivr@from-internal-00000008;1"), None);
    }

    #[test]
    fn test_plain_numbers_and_garbage() {
        assert_eq!(extract_extension("555").as_deref(), Some("555"));
        assert_eq!(extract_extension("+74951234567").as_deref(), Some("+74951234567"));
        assert_eq!(extract_extension("<unknown>"), None);
        assert_eq!(extract_extension(""), None);
        assert_eq!(extract_extension("DAHDI/1-1"), None);
    }

    #[test]
    fn test_channel_key() {
        assert_eq!(extract_channel_key("SIP/100-0000002a").as_deref(), Some("0000002a"));
        assert_eq!(
            extract_channel_key("Local/300@from-internal-00000004;1").as_deref(),
            Some("00000004")
        );
        assert_eq!(
            extract_channel_key("SIP/100-0000002a<ZOMBIE>").as_deref(),
            Some("0000002a")
        );
        assert_eq!(extract_channel_key("SIP/100"), None);
    }

    #[test]
    fn test_hash_at_start_is_kept() {
        assert_eq!(extract_peer("FMPR-#12").as_deref(), Some("#12"));
    }
}
