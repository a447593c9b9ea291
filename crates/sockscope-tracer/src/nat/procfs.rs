//! Conntrack backend reading the kernel's `nf_conntrack` table.
//!
//! The compatible fallback when the pinned map is unavailable. Only
//! translated flows are indexed, under both their original and reply
//! tuples. A mapping is kept until its conntrack timeout runs out or a
//! rescan no longer lists it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till1, take_until, take_while1},
    character::complete::{alphanumeric1, char, digit1, space0, space1},
    combinator::map,
    multi::many0,
    sequence::{delimited, preceded, separated_pair},
};
use parking_lot::Mutex;
use sockscope_common::error::{Result, SockscopeError};
use sockscope_common::types::{ConnType, ConnectionTuple};

use super::{Conntracker, IpTranslation};

/// Backend name.
pub const KIND: &str = "procfs";

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// One flow of the conntrack table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackRecord {
    /// Tuple of the original direction.
    pub orig: ConnectionTuple,
    /// Tuple of the reply direction.
    pub reply: ConnectionTuple,
    /// Seconds until the kernel drops the flow.
    pub timeout_secs: u64,
}

impl ConntrackRecord {
    /// Whether the reply direction differs from the reversed original.
    #[must_use]
    pub fn is_translated(&self) -> bool {
        !IpTranslation::is_identity(&self.orig, &self.reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field<'a> {
    Pair(&'a str, &'a str),
    Flag,
    Word,
}

/// `ipv4 2 tcp 6 431999`
fn header(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (_, _, _, _, _, _, proto, _, timeout)) = (
        alphanumeric1,
        space1,
        digit1,
        space1,
        alphanumeric1,
        space1,
        digit1,
        space1,
        digit1,
    )
        .parse(input)?;
    Ok((input, (proto, timeout)))
}

fn field(input: &str) -> IResult<&str, Field<'_>> {
    let key = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_');
    let word = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_');
    alt((
        map(delimited(char('['), take_until("]"), tag("]")), |_| Field::Flag),
        map(
            separated_pair(key, char('='), take_till1(|c: char| c.is_whitespace())),
            |(k, v)| Field::Pair(k, v),
        ),
        map(word, |_| Field::Word),
    ))
    .parse(input)
}

fn fields(input: &str) -> IResult<&str, Vec<Field<'_>>> {
    let (input, parsed) = many0(preceded(space1, field)).parse(input)?;
    let (input, _) = space0(input)?;
    Ok((input, parsed))
}

#[derive(Default)]
struct PartialTuple<'a> {
    src: Option<&'a str>,
    dst: Option<&'a str>,
    sport: Option<&'a str>,
    dport: Option<&'a str>,
}

impl PartialTuple<'_> {
    const fn is_complete(&self) -> bool {
        self.src.is_some() && self.dst.is_some() && self.sport.is_some() && self.dport.is_some()
    }

    fn build(&self, conn_type: ConnType) -> Option<ConnectionTuple> {
        let source: IpAddr = self.src?.parse().ok()?;
        let dest: IpAddr = self.dst?.parse().ok()?;
        Some(ConnectionTuple::new(
            conn_type,
            source,
            self.sport?.parse().ok()?,
            dest,
            self.dport?.parse().ok()?,
        ))
    }
}

/// Parses one line of `/proc/net/nf_conntrack`.
///
/// Returns `None` for malformed lines and for transports other than TCP
/// and UDP.
#[must_use]
pub fn parse_line(line: &str) -> Option<ConntrackRecord> {
    let (rest, (proto, timeout)) = header(line.trim_start()).ok()?;
    let conn_type = match proto.parse::<u8>().ok()? {
        IPPROTO_TCP => ConnType::Tcp,
        IPPROTO_UDP => ConnType::Udp,
        _ => return None,
    };
    let (_, parsed) = fields(rest).ok()?;

    let mut tuples: Vec<ConnectionTuple> = Vec::with_capacity(2);
    let mut current = PartialTuple::default();
    for field in parsed {
        let Field::Pair(k, v) = field else { continue };
        match k {
            "src" => current.src = Some(v),
            "dst" => current.dst = Some(v),
            "sport" => current.sport = Some(v),
            "dport" => current.dport = Some(v),
            _ => continue,
        }
        if current.is_complete() {
            tuples.push(current.build(conn_type)?);
            current = PartialTuple::default();
            if tuples.len() == 2 {
                break;
            }
        }
    }
    let [orig, reply] = tuples[..] else {
        return None;
    };
    Some(ConntrackRecord {
        orig,
        reply,
        timeout_secs: timeout.parse().ok()?,
    })
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    translation: IpTranslation,
    expires: Instant,
}

#[derive(Debug, Default)]
struct ProcState {
    index: HashMap<ConnectionTuple, Cached>,
    last_scan: Option<Instant>,
}

/// Conntracker over the procfs conntrack table.
#[derive(Debug)]
pub struct ProcConntracker {
    path: PathBuf,
    rescan_interval: Duration,
    state: Mutex<ProcState>,
    closed: AtomicBool,
}

impl ProcConntracker {
    /// Reads the table at `path` and indexes its translated flows.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn open(path: &Path, rescan_interval: Duration) -> Result<Self> {
        let backend = Self {
            path: path.to_path_buf(),
            rescan_interval,
            state: Mutex::new(ProcState::default()),
            closed: AtomicBool::new(false),
        };
        let indexed = {
            let mut state = backend.state.lock();
            backend.rescan(&mut state)?
        };
        tracing::debug!(path = %path.display(), indexed, "indexed conntrack table");
        Ok(backend)
    }

    /// Rebuilds the index from the table, returning the number of indexed
    /// tuples.
    fn rescan(&self, state: &mut ProcState) -> Result<usize> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| SockscopeError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        let now = Instant::now();
        let mut index = HashMap::new();
        for record in content.lines().filter_map(parse_line) {
            if !record.is_translated() {
                continue;
            }
            let expires = now + Duration::from_secs(record.timeout_secs);
            let _ = index.insert(
                record.orig,
                Cached {
                    translation: IpTranslation::from_reply(&record.reply),
                    expires,
                },
            );
            let _ = index.insert(
                record.reply,
                Cached {
                    translation: IpTranslation::from_reply(&record.orig),
                    expires,
                },
            );
        }
        state.index = index;
        state.last_scan = Some(now);
        Ok(state.index.len())
    }

    fn cached(state: &mut ProcState, key: &ConnectionTuple, now: Instant) -> Option<IpTranslation> {
        let hit = state.index.get(key).copied()?;
        if hit.expires > now {
            return Some(hit.translation);
        }
        let _ = state.index.remove(key);
        None
    }
}

impl Conntracker for ProcConntracker {
    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let key = tuple.without_netns();
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(hit) = Self::cached(&mut state, &key, now) {
            return Some(hit);
        }
        let due = state
            .last_scan
            .is_none_or(|at| now.duration_since(at) >= self.rescan_interval);
        if !due {
            return None;
        }
        if let Err(e) = self.rescan(&mut state) {
            tracing::warn!(error = %e, "conntrack table rescan failed");
            return None;
        }
        Self::cached(&mut state, &key, Instant::now())
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn refresh(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if let Err(e) = self.rescan(&mut state) {
            tracing::warn!(error = %e, "conntrack table rescan failed");
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.state.lock().index.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const DNAT: &str = "ipv4     2 tcp      6 431999 ESTABLISHED src=10.0.0.1 dst=10.96.0.10 sport=40000 dport=80 src=172.17.0.5 dst=10.0.0.1 sport=8080 dport=40000 [ASSURED] mark=0 zone=0 use=2";
    const PLAIN: &str = "ipv4     2 udp      17 29 src=10.0.0.1 dst=8.8.8.8 sport=5353 dport=53 src=8.8.8.8 dst=10.0.0.1 sport=53 dport=5353 mark=0 use=2";
    const ICMP: &str = "ipv4     2 icmp     1 29 src=10.0.0.1 dst=8.8.8.8 type=8 code=0 id=7 src=8.8.8.8 dst=10.0.0.1 type=0 code=0 id=7 mark=0 use=2";
    const SNAT_V6: &str = "ipv6     10 udp      17 25 src=fd00::2 dst=2001:db8::1 sport=6000 dport=443 [UNREPLIED] src=2001:db8::1 dst=2001:db8::ff sport=443 dport=61000 mark=0 use=1";

    fn table(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
        file
    }

    #[test]
    fn parses_translated_tcp_flow() {
        let record = parse_line(DNAT).expect("parse");
        assert_eq!(record.orig.conn_type, ConnType::Tcp);
        assert_eq!(record.orig.dport, 80);
        assert_eq!(record.reply.source, "172.17.0.5".parse::<IpAddr>().expect("ip"));
        assert_eq!(record.timeout_secs, 431_999);
        assert!(record.is_translated());
    }

    #[test]
    fn parses_ipv6_with_flags_between_tuples() {
        let record = parse_line(SNAT_V6).expect("parse");
        assert_eq!(record.reply.dport, 61000);
        assert!(record.is_translated());
    }

    #[test]
    fn untranslated_and_foreign_lines() {
        assert!(!parse_line(PLAIN).expect("parse").is_translated());
        assert!(parse_line(ICMP).is_none());
        assert!(parse_line("garbage").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn indexes_both_sides_of_translated_flows() {
        let file = table(&[DNAT, PLAIN, "not a conntrack line"]);
        let ct = ProcConntracker::open(file.path(), Duration::from_secs(60)).expect("open");
        let record = parse_line(DNAT).expect("parse");

        let out = ct.lookup(&record.orig).expect("orig");
        assert_eq!(out.repl_src_port, 8080);
        let back = ct.lookup(&record.reply.with_netns(9)).expect("reply");
        assert_eq!(back.repl_dst_port, 80);

        let plain = parse_line(PLAIN).expect("parse");
        assert!(ct.lookup(&plain.orig).is_none());
    }

    #[test]
    fn rescan_picks_up_new_flows_and_drops_vanished_ones() {
        let mut file = table(&[DNAT]);
        let ct = ProcConntracker::open(file.path(), Duration::ZERO).expect("open");
        let snat = parse_line(SNAT_V6).expect("parse");
        assert!(ct.lookup(&snat.orig).is_none());

        writeln!(file, "{SNAT_V6}").expect("append");
        assert!(ct.lookup(&snat.orig).is_some());

        std::fs::write(file.path(), format!("{SNAT_V6}\n")).expect("rewrite");
        let plain = parse_line(PLAIN).expect("parse");
        assert!(ct.lookup(&plain.orig).is_none());
        let dnat = parse_line(DNAT).expect("parse");
        assert!(ct.lookup(&dnat.orig).is_none());
    }

    #[test]
    fn refresh_ignores_the_rescan_interval() {
        let mut file = table(&[]);
        let ct = ProcConntracker::open(file.path(), Duration::from_secs(3600)).expect("open");
        let dnat = parse_line(DNAT).expect("parse");

        writeln!(file, "{DNAT}").expect("append");
        assert!(ct.lookup(&dnat.orig).is_none());
        ct.refresh();
        assert!(ct.lookup(&dnat.orig).is_some());
    }

    #[test]
    fn resolver_retry_sees_flow_added_after_the_last_scan() {
        use std::sync::Arc;

        use sockscope_common::config::NatRetryConfig;

        use crate::nat::{NatResolver, Resolution};
        use crate::telemetry::Telemetry;

        let mut file = table(&[]);
        let ct = ProcConntracker::open(file.path(), Duration::from_millis(250)).expect("open");
        let telemetry = Arc::new(Telemetry::default());
        let resolver = NatResolver::new(Box::new(ct), NatRetryConfig::default(), Arc::clone(&telemetry));
        let dnat = parse_line(DNAT).expect("parse");

        writeln!(file, "{DNAT}").expect("append");
        let out = resolver.resolve(&dnat.orig, Duration::ZERO);
        assert!(matches!(out, Resolution::Found(t) if t.repl_src_ip == dnat.reply.source));
        assert!(telemetry.snapshot().nat_retries <= 1);
    }

    #[test]
    fn missing_table_fails_to_open() {
        let err = ProcConntracker::open(Path::new("/nonexistent/nf_conntrack"), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SockscopeError::Io { .. }));
    }
}
