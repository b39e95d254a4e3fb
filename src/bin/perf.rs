//! Dataplane performance tool
//!
//! Pushes synthetic events through a balancer (or straight at a receiver)
//! and measures what arrives on the other side.
//!
//! Usage:
//!   # receive on 4 threads for 20 seconds
//!   ejfat-perf --recv -u "$URI" -p 20000 -t 4 -d 20
//!
//!   # send 10000 events of 100 kB at 500 events/s
//!   ejfat-perf --send -u "$URI" --size 100000 --count 10000 --rate 500
//!
//! The receiver prints a stats line every second; both sides print a final
//! summary with throughput.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ejfat::{
    EjfatUri, Reassembler, ReassemblerFlags, Segmenter, SegmenterFlags, TokenScope,
    DEFAULT_DATA_PORT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Send,
    Recv,
}

struct PerfArgs {
    mode: Option<Mode>,
    uri: Option<String>,
    mtu: usize,
    event_size: usize,
    count: u64,
    rate: u64,
    threads: usize,
    address: IpAddr,
    port: u16,
    with_lb_header: bool,
    duration_secs: u64,
    verbose: bool,
}

impl Default for PerfArgs {
    fn default() -> Self {
        Self {
            mode: None,
            uri: None,
            mtu: 1500,
            event_size: 100_000,
            count: 1000,
            rate: 0,
            threads: 1,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_DATA_PORT,
            with_lb_header: false,
            duration_secs: 10,
            verbose: false,
        }
    }
}

fn parse_args() -> PerfArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = PerfArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--send" => parsed.mode = Some(Mode::Send),
            "--recv" => parsed.mode = Some(Mode::Recv),
            "--uri" | "-u" => {
                if i + 1 < args.len() {
                    parsed.uri = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--mtu" | "-m" => {
                if i + 1 < args.len() {
                    parsed.mtu = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    parsed.event_size = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    parsed.count = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--rate" | "-r" => {
                if i + 1 < args.len() {
                    parsed.rate = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--threads" | "-t" => {
                if i + 1 < args.len() {
                    parsed.threads = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--address" | "-a" => {
                if i + 1 < args.len() {
                    parsed.address = args[i + 1].parse().expect("valid IP address required");
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.port = args[i + 1].parse().expect("valid port required");
                    i += 1;
                }
            }
            "--with-lb-header" => parsed.with_lb_header = true,
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    parsed.duration_secs = args[i + 1].parse().expect("valid number required");
                    i += 1;
                }
            }
            "--verbose" | "-v" => parsed.verbose = true,
            "--help" | "-h" => {
                println!(
                    r#"ejfat-perf - dataplane load generator and sink

Sends synthetic events through the dataplane named by an EJFAT URI, or
receives and reassembles them. The URI comes from -u/--uri or the
EJFAT_URI environment variable.

Modes:
  --send                  segment and send synthetic events
  --recv                  receive, reassemble and count events

Options:
  -u, --uri <URI>         EJFAT URI (default: EJFAT_URI env var)
  -m, --mtu <BYTES>       path MTU for segmentation (default: 1500)
  -s, --size <BYTES>      event payload size to send (default: 100000)
  -c, --count <N>         number of events to send (default: 1000)
  -r, --rate <EPS>        pace sends at N events/s (default: 0 = unpaced)
  -t, --threads <N>       receive threads (default: 1)
  -a, --address <IP>      receive bind address (default: 0.0.0.0)
  -p, --port <PORT>       first receive port (default: 19522)
  --with-lb-header        datagrams still carry the balancer header
  -d, --duration <SECS>   how long to receive (default: 10)
  -v, --verbose           debug logging
  -h, --help              this help

Examples:
  # loopback smoke test, no balancer in the path
  ejfat-perf --recv -u "ejfat://host:18020/lb/1?data=127.0.0.1" \
      -a 127.0.0.1 -p 20000 --with-lb-header -d 15 &
  ejfat-perf --send -u "ejfat://host:18020/lb/1?data=127.0.0.1:20000" \
      --size 50000 --count 5000 --rate 1000
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

fn load_uri(args: &PerfArgs) -> Result<EjfatUri, Box<dyn std::error::Error>> {
    let raw = match &args.uri {
        Some(raw) => raw.clone(),
        None => std::env::var("EJFAT_URI").map_err(|_| "no URI: pass -u or set EJFAT_URI")?,
    };
    Ok(EjfatUri::parse_with(&raw, TokenScope::Instance, false)?)
}

fn run_send(args: &PerfArgs) -> Result<(), Box<dyn std::error::Error>> {
    let uri = load_uri(args)?;

    let mut flags = SegmenterFlags::new();
    flags.mtu = args.mtu;
    // sync reporting only works when the URI says where to aim it
    flags.use_cp = uri.sync_addr().is_some();

    let data_id = 1u16;
    let event_src_id = std::process::id();
    let mut segmenter = Segmenter::new(uri, data_id, event_src_id, flags)?;
    segmenter.open()?;

    info!("sending {} events of {} bytes", args.count, args.event_size);
    if args.rate > 0 {
        info!("pacing at {} events/s", args.rate);
    }

    let payload: Vec<u8> = (0..args.event_size).map(|i| i as u8).collect();
    let interval = if args.rate > 0 {
        Some(Duration::from_secs_f64(1.0 / args.rate as f64))
    } else {
        None
    };

    let start = Instant::now();
    let mut last_report = Instant::now();
    for n in 0..args.count {
        segmenter.send(&payload)?;

        if let Some(interval) = interval {
            let due = start + interval * (n as u32 + 1);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        if last_report.elapsed() >= Duration::from_secs(2) {
            info!("sent {}/{} events | {}", n + 1, args.count, segmenter.send_stats().summary());
            last_report = Instant::now();
        }
    }

    let elapsed = start.elapsed();
    let stats = segmenter.send_stats();
    let sync = segmenter.sync_stats();
    segmenter.close();

    let total_bytes = args.count * args.event_size as u64;
    info!("send complete");
    info!("  events: {}", args.count);
    info!("  datagrams: {}", stats.datagram_count);
    info!("  send errors: {}", stats.error_count);
    info!("  sync messages: {}", sync.msg_count);
    info!("  time: {:.2}s", elapsed.as_secs_f64());
    if elapsed.as_secs_f64() > 0.0 {
        info!(
            "  throughput: {:.2} MB/s ({:.0} events/s)",
            total_bytes as f64 / elapsed.as_secs_f64() / 1_000_000.0,
            args.count as f64 / elapsed.as_secs_f64()
        );
    }
    Ok(())
}

fn run_recv(args: &PerfArgs) -> Result<(), Box<dyn std::error::Error>> {
    let uri = load_uri(args)?;

    let mut flags = ReassemblerFlags::new();
    flags.use_cp = false;
    flags.with_lb_header = args.with_lb_header;

    let mut reassembler = Reassembler::new(uri, args.address, args.port, args.threads, flags)?;
    reassembler.open_and_start()?;
    info!(
        "receiving on {} ports from {}:{} for {}s",
        reassembler.port_count(),
        args.address,
        args.port,
        args.duration_secs
    );

    let start = Instant::now();
    let deadline = start + Duration::from_secs(args.duration_secs);
    let mut events = 0u64;
    let mut total_bytes = 0u64;
    let mut last_report = Instant::now();

    while Instant::now() < deadline {
        if let Some(event) = reassembler.receive(100)? {
            events += 1;
            total_bytes += event.payload.len() as u64;
        }
        while let Some(lost) = reassembler.poll_lost_event()? {
            info!("lost event {} from source {}", lost.event_number, lost.data_id);
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            info!("{}", reassembler.stats().summary());
            last_report = Instant::now();
        }
    }

    let elapsed = start.elapsed();
    let stats = reassembler.stats();
    reassembler.close();

    info!("receive complete");
    info!("  events: {}", events);
    info!("  bytes: {}", total_bytes);
    info!("  timeouts: {}", stats.event_timeout_count);
    info!("  queue drops: {}", stats.enqueue_loss);
    info!("  data errors: {}", stats.data_err_count);
    if elapsed.as_secs_f64() > 0.0 {
        info!(
            "  throughput: {:.2} MB/s ({:.0} events/s)",
            total_bytes as f64 / elapsed.as_secs_f64() / 1_000_000.0,
            events as f64 / elapsed.as_secs_f64()
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.mode {
        Some(Mode::Send) => run_send(&args),
        Some(Mode::Recv) => run_recv(&args),
        None => {
            eprintln!("pick a mode: --send or --recv (see --help)");
            std::process::exit(1);
        }
    }
}
