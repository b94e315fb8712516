//! netsed command - transparent TCP/UDP proxy with on-the-wire substitution.

use std::io;
use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;
use netsed::proxy::{Proxy, ProxyConfig, Transport};
use netsed::rules::{Rule, RuleSet};
use netsed::{Error, Result};

const RULE_HELP: &str = "\
General syntax of replacement rules: s/pat1/pat2[/expire]

This will replace all occurrences of pat1 with pat2 in any matching packet.
An additional parameter (count) can be used to expire a rule after 'count'
successful substitutions for a given connection. Eight-bit characters,
including NULL and '/', can be passed using HTTP-like hex escape
sequences (e.g. CRLF as %0a%0d). A match on '%' can be achieved by
specifying '%%'. Examples:

  's/andrew/mike/1'     - replace 'andrew' with 'mike' (only first time)
  's/andrew/mike'       - replace all occurrences of 'andrew' with 'mike'
  's/andrew/mike%00%00' - replace 'andrew' with 'mike\\x00\\x00'
                          (manually padding to keep original size)
  's/%%/%2f/20'         - replace the 20 first occurrences of '%' with '/'

Rules are not active across packet boundaries, and they are evaluated
from first to last, not yet expired rule, as stated on the command line.";

#[derive(Parser)]
#[command(
    name = "netsed",
    version,
    about = "Transparent proxy that rewrites TCP/UDP traffic in flight",
    after_help = RULE_HELP
)]
struct Cli {
    /// Protocol to intercept: tcp or udp.
    proto: Transport,

    /// Local port to listen on (see the docs for transparent traffic
    /// interception on some systems).
    lport: String,

    /// Where connections should be forwarded (0 = use the destination
    /// address of the incoming connection).
    rhost: String,

    /// Destination port (0 = destination port of the incoming connection).
    rport: String,

    /// Replacement rules, applied in this order.
    #[arg(required = true, num_args = 1..)]
    rules: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit 1; --help and --version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    // Peer-closed writes must surface as error returns on the affected flow,
    // never as a process-fatal signal. The Rust runtime already ignores
    // SIGPIPE; keep the disposition explicit since forwarding depends on it.
    // SAFETY: setting a disposition to SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[-] Error: {e}");
            eprintln!("netsed: exiting.");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    println!("netsed {} (network stream editor)", env!("CARGO_PKG_VERSION"));

    let mut rules = Vec::with_capacity(cli.rules.len());
    for text in &cli.rules {
        println!("[*] Parsing rule {text}...");
        rules.push(Rule::parse(text)?);
    }
    let rules = RuleSet::new(rules);
    println!(
        "[+] Loaded {} rule{}...",
        rules.len(),
        if rules.len() > 1 { "s" } else { "" }
    );

    let listen_port = parse_port(&cli.lport)?;
    let fixed_host = resolve_host(&cli.rhost).await?;
    let fixed_port = match cli.rport.as_str() {
        "0" => None,
        other => Some(parse_port(other)?),
    };

    match (fixed_host, fixed_port) {
        (Some(_), Some(_)) => {
            println!("[+] Using fixed forwarding to {},{}.", cli.rhost, cli.rport);
        }
        (None, Some(_)) => {
            println!(
                "[+] Using dynamic (transparent proxy) forwarding with fixed port {}.",
                cli.rport
            );
        }
        (Some(_), None) => {
            println!(
                "[+] Using dynamic (transparent proxy) forwarding with fixed addr {}.",
                cli.rhost
            );
        }
        (None, None) => println!("[+] Using dynamic (transparent proxy) forwarding."),
    }

    let mut config = ProxyConfig::new(cli.proto, listen_port, rules);
    config.fixed_host = fixed_host;
    config.fixed_port = fixed_port;

    let proxy = Proxy::bind(config)?;
    println!("[+] Listening on port {}/{}.", cli.lport, cli.proto);

    tokio::select! {
        result = proxy.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("[*] Interrupt received, exiting.");
            Ok(())
        }
    }
}

fn parse_port(text: &str) -> Result<u16> {
    text.parse::<u16>().map_err(|e| Error::Resolution {
        endpoint: text.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

/// Resolve the upstream host; `0` (or anything resolving to an all-zeroes
/// address) selects dynamic forwarding to the original destination.
async fn resolve_host(rhost: &str) -> Result<Option<IpAddr>> {
    if rhost == "0" {
        return Ok(None);
    }
    let mut addrs = tokio::net::lookup_host((rhost, 0u16))
        .await
        .map_err(|e| Error::Resolution {
            endpoint: rhost.to_string(),
            source: e,
        })?;
    let addr = addrs.next().ok_or_else(|| Error::Resolution {
        endpoint: rhost.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "lookup returned no addresses"),
    })?;
    Ok(if addr.ip().is_unspecified() {
        None
    } else {
        Some(addr.ip())
    })
}
