use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;

use zkmirror::config::{
    self, ConfigError, ConnectConfig, DestinationConfig, RsyncOptions, SourceConfig,
};
use zkmirror::coord::{self, SessionClient};
use zkmirror::destination::DestinationCoordinator;
use zkmirror::identity::Identity;
use zkmirror::source::{self, SourceCoordinator};
use zkmirror::walk::{self, WalkFilter};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "zkmirror",
    version,
    about = "Coordinated parallel rsync replication for partitioned directory trees",
    long_about = "`zkmirror` replicates one directory tree to many destination hosts in parallel.

Start one or more --source processes and one or more --destination processes with the same --session name against the same ZooKeeper ensemble. The first source to start partitions the tree into work units and manages the run; the remaining sources transfer units with rsync to the rsync daemons the destinations run and advertise. All shared state (work queues, membership, destination health, transfer statistics) lives in ZooKeeper."
)]
struct Args {
    /// ZooKeeper ensemble, comma-separated host:port addresses
    #[arg(
        long,
        value_name = "HOSTS",
        value_delimiter = ',',
        default_value = "localhost:2181"
    )]
    servers: Vec<String>,

    /// Session name; isolates one replication run from another
    #[arg(short = 'N', long, value_name = "NAME", default_value = "default")]
    session: String,

    /// Run as a source (transfers work units)
    #[arg(short = 'S', long)]
    source: bool,

    /// Run as a destination (hosts an rsync daemon)
    #[arg(short = 'D', long)]
    destination: bool,

    /// Base path: tree to replicate (source) or to receive into (destination)
    #[arg(short = 'p', long, value_name = "PATH")]
    path: Option<PathBuf>,

    /// ZooKeeper digest credentials as user:password
    #[arg(long, value_name = "USER:PASS")]
    credentials: Option<String>,

    /// Identity suffix for running several processes of one role per host
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Replace the hostname's domain part in the process identity
    ///
    /// Destinations advertise their identity host as the rsync dial target,
    /// so use this where the resolver returns a short name but sources must
    /// dial a fully qualified one.
    #[arg(long, value_name = "DOMAIN")]
    domain: Option<String>,

    /// Report the session's progress and exit
    ///
    /// Exits 14 when no run is in progress.
    #[arg(long)]
    state: bool,

    /// Partition the tree, print the work units and exit without connecting
    #[arg(long)]
    paths_only: bool,

    /// Transfer attempts per work unit (source), daemon relaunch attempts
    /// (destination)
    #[arg(long, value_name = "N", default_value = "3")]
    attempts: u32,

    /// Skip the base path reachability checks
    #[arg(long)]
    no_verify_path: bool,

    // Source options
    /// Partition depth; 0 replicates the whole tree as one unit
    #[arg(long, value_name = "N", default_value = "4", help_heading = "Source options")]
    depth: u32,

    /// Exclude paths matching this regex from the partition
    #[arg(long, value_name = "REGEX", help_heading = "Source options")]
    exclude_re: Option<String>,

    /// Only exclude matching paths owned by this user
    #[arg(long, value_name = "USER", help_heading = "Source options")]
    exclude_user: Option<String>,

    /// Re-partition a subpath deeper, as {depth}_{subpath}; repeatable,
    /// deepest last
    #[arg(long = "subpath", value_name = "SPEC", help_heading = "Source options")]
    subpath_overrides: Vec<String>,

    /// Write the final {unfinished, failed, completed} record here
    #[arg(long, value_name = "FILE", help_heading = "Source options")]
    done_file: Option<PathBuf>,

    // Rsync options
    /// Pass -n: show what would be transferred without transferring
    #[arg(short = 'n', long, help_heading = "Rsync options")]
    dry_run: bool,

    /// Pass --delete: remove destination files missing from the source
    #[arg(long, help_heading = "Rsync options")]
    delete: bool,

    /// Pass --checksum: compare by checksum instead of size and mtime
    #[arg(long, help_heading = "Rsync options")]
    checksum: bool,

    /// Pass --hard-links: preserve hard links within each work unit
    #[arg(long, help_heading = "Rsync options")]
    hard_links: bool,

    /// Pass --verbose and log the per-unit file listing
    #[arg(long, help_heading = "Rsync options")]
    rsync_verbose: bool,

    /// Pass --timeout: per-transfer I/O timeout in seconds
    #[arg(long, value_name = "SECS", help_heading = "Rsync options")]
    rsync_timeout: Option<u64>,

    /// Extra rsync flag as key:value, passed as --key=value; repeatable
    ///
    /// Applied last and unvalidated: the operator owns what goes in here.
    #[arg(long = "rsync-opt", value_name = "KEY:VALUE", help_heading = "Rsync options")]
    rsync_opts: Vec<String>,

    /// Pass --drop-cache (patched rsync) to transfers and the daemon
    #[arg(long, help_heading = "Rsync options")]
    drop_cache: bool,

    // Destination options
    /// Fixed daemon port; fails when the port is already claimed on this host
    #[arg(long, value_name = "PORT", help_heading = "Destination options")]
    port: Option<u16>,

    /// First port probed when no fixed port is given
    #[arg(
        long,
        value_name = "PORT",
        default_value = "4444",
        help_heading = "Destination options"
    )]
    start_port: u16,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,
}

fn init_tracing(quiet: bool, verbose: u8) {
    let level = if quiet {
        "off"
    } else {
        match verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn rsync_options(args: &Args) -> RsyncOptions {
    RsyncOptions {
        dry_run: args.dry_run,
        delete: args.delete,
        checksum: args.checksum,
        hard_links: args.hard_links,
        verbose: args.rsync_verbose,
        drop_cache: args.drop_cache,
        timeout: args.rsync_timeout,
        passthrough: args.rsync_opts.clone(),
    }
}

fn source_config(args: &Args) -> SourceConfig {
    SourceConfig {
        base_path: args.path.clone().unwrap_or_default(),
        depth: args.depth,
        exclude_re: args.exclude_re.clone(),
        exclude_user: args.exclude_user.clone(),
        subpath_overrides: args.subpath_overrides.clone(),
        rsync: rsync_options(args),
        done_file: args.done_file.clone(),
        verify_path: !args.no_verify_path,
        attempts: args.attempts,
    }
}

fn destination_config(args: &Args) -> DestinationConfig {
    DestinationConfig {
        base_path: args.path.clone().unwrap_or_default(),
        port: args.port,
        start_port: args.start_port,
        verify_path: !args.no_verify_path,
        drop_cache: args.drop_cache,
        attempts: args.attempts,
    }
}

/// Partition the tree and print the work units, no coordination involved.
fn report_paths(args: &Args) -> anyhow::Result<i32> {
    let cfg = source_config(args);
    cfg.validate()?;
    let filter = WalkFilter::new(cfg.exclude_re.as_deref(), cfg.exclude_user.as_deref())?;
    let started = std::time::Instant::now();
    let units = walk::get_pathlist(&cfg.base_path, cfg.depth, &filter, &cfg.subpath_overrides)?;
    for token in walk::encode_paths(&units) {
        println!("{token}");
    }
    println!(
        "partitioned {} into {} units in {:.2?}",
        cfg.base_path.display(),
        units.len(),
        started.elapsed()
    );
    Ok(0)
}

async fn async_main(args: Args) -> anyhow::Result<i32> {
    let connect = ConnectConfig {
        servers: args.servers.clone(),
        session: args.session.clone(),
        credentials: args
            .credentials
            .as_deref()
            .map(config::parse_credentials)
            .transpose()?,
        name: args.name.clone(),
    };
    connect.validate()?;
    let identity = Identity::local(connect.name.as_deref(), args.domain.as_deref())
        .context("failed to build process identity")?;

    if args.state {
        let session = SessionClient::connect(&connect, identity, &[]).await?;
        return source::report_state(&session).await;
    }
    match (args.source, args.destination) {
        (true, false) => {
            let cfg = source_config(&args);
            let session = SessionClient::connect(
                &connect,
                identity,
                &[coord::PARTY_ALL, coord::PARTY_SOURCES],
            )
            .await?;
            SourceCoordinator::new(session, cfg).await?.run().await?;
            Ok(0)
        }
        (false, true) => {
            let cfg = destination_config(&args);
            let session = SessionClient::connect(
                &connect,
                identity,
                &[coord::PARTY_ALL, coord::PARTY_DESTS],
            )
            .await?;
            DestinationCoordinator::new(session, cfg)?.run().await?;
            Ok(0)
        }
        (true, true) => Err(ConfigError::ConflictingRoles.into()),
        (false, false) => bail!("specify a role: --source, --destination or --state"),
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_tracing(args.quiet, args.verbose);
    let result = if args.paths_only {
        report_paths(&args)
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start the async runtime")
            .and_then(|runtime| runtime.block_on(async_main(args)))
    };
    match result {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
