//! Beacon wire format: `PREFIX:<senderIPv4>:<comma-separated file ids>` as ASCII text over UDP.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Fixed prefix identifying reelshare presence packets.
pub const ANNOUNCE_PREFIX: &str = "REELSHARE_P2P";
/// Beacon UDP port.
pub const DEFAULT_BEACON_PORT: u16 = 8889;
/// Receive buffer size; encoded announces never exceed it.
pub const MAX_ANNOUNCE_LEN: usize = 4096;

/// One presence message: who is speaking and which file ids it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub ip: Ipv4Addr,
    pub files: BTreeSet<String>,
}

impl Announce {
    /// File ids that cannot be represented (empty, or containing the list separator) are dropped.
    pub fn new<I, S>(ip: Ipv4Addr, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files = files
            .into_iter()
            .map(Into::into)
            .filter(|f: &String| !f.is_empty() && !f.contains(','))
            .collect();
        Self { ip, files }
    }

    /// Encode, omitting trailing file ids once the packet would exceed `MAX_ANNOUNCE_LEN`.
    pub fn encode(&self) -> String {
        let mut out = format!("{}:{}:", ANNOUNCE_PREFIX, self.ip);
        let mut first = true;
        for f in &self.files {
            let extra = f.len() + usize::from(!first);
            if out.len() + extra > MAX_ANNOUNCE_LEN {
                break;
            }
            if !first {
                out.push(',');
            }
            out.push_str(f);
            first = false;
        }
        out
    }

    /// Parse a received datagram. Foreign prefixes and malformed addresses yield `None`.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(packet).ok()?;
        let mut parts = text.splitn(3, ':');
        if parts.next()? != ANNOUNCE_PREFIX {
            return None;
        }
        let ip: Ipv4Addr = parts.next()?.trim().parse().ok()?;
        let files = parts
            .next()
            .map(|list| {
                list.trim_end_matches(['\0', '\n', '\r'])
                    .split(',')
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { ip, files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse() {
        let a = Announce::new(Ipv4Addr::new(192, 168, 1, 7), ["movie", "trailer"]);
        let wire = a.encode();
        assert_eq!(wire, "REELSHARE_P2P:192.168.1.7:movie,trailer");
        assert_eq!(Announce::parse(wire.as_bytes()), Some(a));
    }

    #[test]
    fn parse_without_file_list() {
        let a = Announce::parse(b"REELSHARE_P2P:10.0.0.2").unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert!(a.files.is_empty());
        let b = Announce::parse(b"REELSHARE_P2P:10.0.0.2:").unwrap();
        assert!(b.files.is_empty());
    }

    #[test]
    fn file_ids_may_contain_colons() {
        let a = Announce::parse(b"REELSHARE_P2P:10.0.0.2:a:b,c").unwrap();
        assert!(a.files.contains("a:b"));
        assert!(a.files.contains("c"));
    }

    #[test]
    fn rejects_foreign_and_malformed() {
        assert!(Announce::parse(b"OTHER_APP:10.0.0.2:x").is_none());
        assert!(Announce::parse(b"REELSHARE_P2P:not-an-ip:x").is_none());
        assert!(Announce::parse(b"REELSHARE_P2P").is_none());
        assert!(Announce::parse(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn unrepresentable_ids_dropped() {
        let a = Announce::new(Ipv4Addr::LOCALHOST, ["ok", "bad,id", ""]);
        assert_eq!(a.files.len(), 1);
    }

    #[test]
    fn encode_is_bounded() {
        let many: Vec<String> = (0..2000).map(|i| format!("title-{i:05}")).collect();
        let a = Announce::new(Ipv4Addr::new(10, 1, 2, 3), many);
        let wire = a.encode();
        assert!(wire.len() <= MAX_ANNOUNCE_LEN);
        let back = Announce::parse(wire.as_bytes()).unwrap();
        assert!(!back.files.is_empty());
        assert!(back.files.len() < 2000);
    }
}
