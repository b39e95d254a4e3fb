//! Balancer administration tool
//!
//! Drives the control plane workflow end to end: reserve an instance, wire
//! up senders, register workers, watch status, free it again.
//!
//! Usage:
//!   lbadm --reserve -l mylb -d 02:00 -s 10.0.0.1,10.0.0.2
//!   lbadm --status -u "ejfat://token@host:18020/lb/3"
//!
//! The URI comes from -u/--uri or the EJFAT_URI environment variable.
//! Actions that create credentials print the updated URI on stdout so it
//! can be handed to the next tool in the chain.

use std::net::IpAddr;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ejfat::{EjfatUri, LbControlClient, TokenScope, DEFAULT_DATA_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Reserve,
    Free,
    Status,
    Overview,
    Version,
    AddSenders,
    RemoveSenders,
    Register,
    Deregister,
    SendState,
}

impl Action {
    /// Which slot of the URI the userinfo token should land in for this
    /// action.
    fn token_scope(self) -> TokenScope {
        match self {
            Action::Reserve | Action::Free | Action::Status | Action::Overview
            | Action::Version => TokenScope::Admin,
            Action::Register | Action::AddSenders | Action::RemoveSenders => {
                TokenScope::Instance
            }
            Action::Deregister | Action::SendState => TokenScope::Session,
        }
    }
}

struct AdminArgs {
    uri: Option<String>,
    action: Option<Action>,
    lb_name: String,
    duration: String,
    senders: Vec<IpAddr>,
    node_name: String,
    node_ip: Option<IpAddr>,
    node_port: u16,
    weight: f64,
    source_count: usize,
    min_factor: f64,
    max_factor: f64,
    fill: f64,
    control: f64,
    not_ready: bool,
    verbose: bool,
}

impl Default for AdminArgs {
    fn default() -> Self {
        Self {
            uri: None,
            action: None,
            lb_name: "ejfat-lb".to_string(),
            duration: "02:00".to_string(),
            senders: Vec::new(),
            node_name: "ejfat-worker".to_string(),
            node_ip: None,
            node_port: DEFAULT_DATA_PORT,
            weight: 1.0,
            source_count: 1,
            min_factor: 0.5,
            max_factor: 2.0,
            fill: 0.0,
            control: 0.0,
            not_ready: false,
            verbose: false,
        }
    }
}

fn parse_ip_list(raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse().expect("valid IP address required"))
        .collect()
}

fn parse_args() -> AdminArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = AdminArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--reserve" => parsed.action = Some(Action::Reserve),
            "--free" => parsed.action = Some(Action::Free),
            "--status" => parsed.action = Some(Action::Status),
            "--overview" => parsed.action = Some(Action::Overview),
            "--version" => parsed.action = Some(Action::Version),
            "--addsenders" => parsed.action = Some(Action::AddSenders),
            "--removesenders" => parsed.action = Some(Action::RemoveSenders),
            "--register" => parsed.action = Some(Action::Register),
            "--deregister" => parsed.action = Some(Action::Deregister),
            "--send-state" => parsed.action = Some(Action::SendState),
            "--uri" | "-u" => {
                if i + 1 < args.len() {
                    parsed.uri = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--lbname" | "-l" => {
                if i + 1 < args.len() {
                    parsed.lb_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    parsed.duration = args[i + 1].clone();
                    i += 1;
                }
            }
            "--senders" | "-s" => {
                if i + 1 < args.len() {
                    parsed.senders = parse_ip_list(&args[i + 1]);
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    parsed.node_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--address" | "-a" => {
                if i + 1 < args.len() {
                    parsed.node_ip = Some(args[i + 1].parse().expect("valid IP address required"));
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.node_port = args[i + 1].parse().expect("valid port required");
                    i += 1;
                }
            }
            "--weight" | "-w" => {
                if i + 1 < args.len() {
                    parsed.weight = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    parsed.source_count = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--minfactor" => {
                if i + 1 < args.len() {
                    parsed.min_factor = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--maxfactor" => {
                if i + 1 < args.len() {
                    parsed.max_factor = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--fill" => {
                if i + 1 < args.len() {
                    parsed.fill = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--control" => {
                if i + 1 < args.len() {
                    parsed.control = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--not-ready" => parsed.not_ready = true,
            "--verbose" | "-v" => parsed.verbose = true,
            "--help" | "-h" => {
                println!(
                    r#"lbadm - load balancer administration

Talks to the balancer control plane named by an EJFAT URI
(-u/--uri or the EJFAT_URI environment variable).

Actions:
  --reserve               reserve an instance, print its instance URI
  --free                  release the instance the URI points at
  --status                show workers and schedule state of the instance
  --overview              show every instance on the host (admin token)
  --version               show control plane software version
  --addsenders <IPS>      allow more sender addresses (also -s)
  --removesenders <IPS>   drop sender addresses (also -s)
  --register              join the worker pool, print the session URI
  --deregister            leave the worker pool (session URI required)
  --send-state            deliver one worker state report (session URI)

Options:
  -u, --uri <URI>         EJFAT URI (default: EJFAT_URI env var)
  -l, --lbname <NAME>     balancer name for --reserve (default: ejfat-lb)
  -d, --duration <DUR>    lease length, seconds or hh:mm[:ss] (default: 02:00)
  -s, --senders <IPS>     comma separated sender IPs
  -n, --name <NAME>       worker node name (default: ejfat-worker)
  -a, --address <IP>      worker receive address (required for --register)
  -p, --port <PORT>       first worker receive port (default: 19522)
  -w, --weight <W>        worker weight (default: 1.0)
  -c, --count <N>         expected event sources (default: 1)
  --minfactor <F>         schedule scaling floor (default: 0.5)
  --maxfactor <F>         schedule scaling ceiling (default: 2.0)
  --fill <F>              queue fill for --send-state (default: 0.0)
  --control <F>           control signal for --send-state (default: 0.0)
  --not-ready             report not-ready with --send-state
  -v, --verbose           debug logging
  -h, --help              this help

Examples:
  # reserve for two hours and allow two senders
  lbadm --reserve -l daq -d 02:00 -s 10.0.0.1,10.0.0.2

  # register a worker using the instance URI printed above
  lbadm --register -u "$URI" -n worker1 -a 10.0.0.9 -p 20000 -c 4
"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }

    parsed
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let action = match args.action {
        Some(action) => action,
        None => {
            eprintln!("no action given; try --help");
            std::process::exit(1);
        }
    };

    let uri = match &args.uri {
        Some(raw) => EjfatUri::parse_with(raw, action.token_scope(), false)?,
        None => match std::env::var("EJFAT_URI") {
            Ok(raw) => EjfatUri::parse_with(&raw, action.token_scope(), false)?,
            Err(_) => {
                eprintln!("no URI: pass -u or set EJFAT_URI");
                std::process::exit(1);
            }
        },
    };
    let mut client = LbControlClient::new(uri)?;

    match action {
        Action::Reserve => {
            let reservation = client.reserve(&args.lb_name, &args.duration, &args.senders)?;
            info!(
                "instance {} on slot {} expires {}",
                reservation.lb_id, reservation.fpga_lb_id, reservation.expires_at
            );
            println!("{}", client.uri().to_string_for(TokenScope::Instance));
        }

        Action::Free => {
            client.free()?;
        }

        Action::Status => {
            let status = client.get_status()?;
            println!(
                "epoch {} | predicted event {} | expires {}",
                status.current_epoch, status.predicted_event_number, status.expires_at
            );
            for worker in &status.workers {
                println!(
                    "  worker {}: fill {:.3}, control {:.3}, {} slots, updated {}",
                    worker.name,
                    worker.fill_percent,
                    worker.control_signal,
                    worker.slots_assigned,
                    worker.last_updated
                );
            }
            for sender in &status.sender_addresses {
                println!("  sender {}", sender);
            }
        }

        Action::Overview => {
            for entry in client.get_overview()? {
                println!(
                    "{} ({}) on slot {}: {} workers, expires {}",
                    entry.name,
                    entry.lb_id,
                    entry.fpga_lb_id,
                    entry.status.workers.len(),
                    entry.status.expires_at
                );
            }
        }

        Action::Version => {
            let version = client.version()?;
            println!(
                "commit {} | build {} | compat {}",
                version.commit, version.build, version.compat_tag
            );
        }

        Action::AddSenders => {
            client.add_senders(&args.senders)?;
            info!("allowed {} sender addresses", args.senders.len());
        }

        Action::RemoveSenders => {
            client.remove_senders(&args.senders)?;
            info!("removed {} sender addresses", args.senders.len());
        }

        Action::Register => {
            let ip = args
                .node_ip
                .ok_or("--address is required with --register")?;
            let reply = client.register(
                &args.node_name,
                ip,
                args.node_port,
                args.weight,
                args.source_count,
                args.min_factor,
                args.max_factor,
            )?;
            info!("registered as session {}", reply.session_id);
            println!("{}", client.uri().to_string_for(TokenScope::Session));
        }

        Action::Deregister => {
            client.resume_session()?;
            client.deregister()?;
        }

        Action::SendState => {
            client.resume_session()?;
            client.send_state(args.fill, args.control, !args.not_ready)?;
            info!("state report delivered");
        }
    }

    Ok(())
}
