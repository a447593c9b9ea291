//! `sockscope conntrack`: query the NAT backends directly.

use std::net::IpAddr;

use anyhow::Context;
use clap::{Args, Subcommand, ValueEnum};
use sockscope_common::config::TracerConfig;
use sockscope_common::types::{ConnType, ConnectionTuple};
use sockscope_tracer::nat::{self, Conntracker};

/// Arguments for the `conntrack` command.
#[derive(Args, Debug)]
pub struct ConntrackArgs {
    /// Conntrack action.
    #[command(subcommand)]
    pub command: ConntrackCommand,
}

/// Conntrack actions.
#[derive(Subcommand, Debug)]
pub enum ConntrackCommand {
    /// Show the reply-direction translation of one flow.
    Lookup(LookupArgs),
    /// Report which backend the fallback chain settles on.
    Backend,
}

/// Transport of the looked-up flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// Arguments for `conntrack lookup`.
#[derive(Args, Debug)]
pub struct LookupArgs {
    /// Source address of the original direction.
    #[arg(long)]
    pub src: IpAddr,
    /// Destination address of the original direction.
    #[arg(long)]
    pub dst: IpAddr,
    /// Source port.
    #[arg(long)]
    pub sport: u16,
    /// Destination port.
    #[arg(long)]
    pub dport: u16,
    /// Transport protocol.
    #[arg(long, value_enum, default_value_t = Proto::Tcp)]
    pub proto: Proto,
    /// Network namespace inode.
    #[arg(long)]
    pub netns: Option<u32>,
}

impl LookupArgs {
    fn tuple(&self) -> ConnectionTuple {
        let conn_type = match self.proto {
            Proto::Tcp => ConnType::Tcp,
            Proto::Udp => ConnType::Udp,
        };
        let tuple = ConnectionTuple::new(conn_type, self.src, self.sport, self.dst, self.dport);
        match self.netns {
            Some(netns) => tuple.with_netns(netns),
            None => tuple,
        }
    }
}

/// Executes the `conntrack` command.
///
/// Ignores `enable_conntrack`: asking for a lookup is explicit.
///
/// # Errors
///
/// Returns an error if no backend can be initialized or the output cannot
/// be serialized.
#[allow(clippy::print_stdout)]
pub fn execute(args: &ConntrackArgs, config: &TracerConfig) -> anyhow::Result<()> {
    let backend = open_backend(config)?;
    match &args.command {
        ConntrackCommand::Backend => println!("{}", backend.kind()),
        ConntrackCommand::Lookup(lookup) => {
            let tuple = lookup.tuple();
            match backend.lookup(&tuple) {
                Some(translation) => println!("{}", serde_json::to_string_pretty(&translation)?),
                None => println!("{tuple}: no translation ({})", backend.kind()),
            }
        }
    }
    backend.close();
    Ok(())
}

fn open_backend(config: &TracerConfig) -> anyhow::Result<Box<dyn Conntracker>> {
    nat::create_conntracker(config, nat::default_factories(config))
        .context("conntrack is unavailable on this host")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    #[test]
    fn lookup_arguments_build_the_tuple() {
        let cli = Cli::try_parse_from([
            "sockscope", "conntrack", "lookup", "--src", "10.0.0.5", "--dst", "10.96.0.10",
            "--sport", "40000", "--dport", "80", "--proto", "udp", "--netns", "7",
        ])
        .expect("parse");
        let Command::Conntrack(ConntrackArgs {
            command: ConntrackCommand::Lookup(lookup),
        }) = cli.command
        else {
            panic!("expected conntrack lookup");
        };
        let tuple = lookup.tuple();
        assert_eq!(tuple.conn_type, ConnType::Udp);
        assert_eq!(tuple.dport, 80);
        assert_eq!(tuple.netns, Some(7));
    }

    #[test]
    fn procfs_backend_reads_configured_table() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(
            &mut file,
            b"ipv4     2 tcp      6 431999 ESTABLISHED src=10.0.0.5 dst=10.96.0.10 sport=40000 dport=80 src=10.244.1.7 dst=10.0.0.5 sport=8080 dport=40000 [ASSURED] mark=0 use=1\n",
        )
        .expect("write");
        let config = TracerConfig {
            enable_ebpf_conntracker: false,
            conntrack_procfs_path: file.path().to_path_buf(),
            ..TracerConfig::default()
        };

        let backend = open_backend(&config).expect("backend");
        assert_eq!(backend.kind(), "procfs");
        let tuple = ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.5".parse().expect("ip"),
            40000,
            "10.96.0.10".parse().expect("ip"),
            80,
        );
        let translation = backend.lookup(&tuple).expect("translation");
        assert_eq!(translation.repl_src_port, 8080);
    }
}
