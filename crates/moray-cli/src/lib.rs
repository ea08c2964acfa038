//! # Moray CLI
//!
//! Command-line tools for a Moray service. Every command connects to the
//! service, performs one RPC and prints the result as raw JSON on stdout, one
//! document per line for streaming commands.
//!
//! ## Choosing a server
//!
//! - `-S/--service` names a service domain, resolved through SRV records
//! - `-H/--host` and `-p/--port` name a single server
//! - Without flags, `MORAY_SERVICE` and then `MORAY_URL` are consulted
//! - Anything still missing falls back to `127.0.0.1` and port `2020`

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use moray_client::{
    BucketConfig, ClientOptions, Defaults, IndexSpec, LegacyOptions, PoolConfig, RequestOptions,
};
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2020;

pub const ENV_URL: &str = "MORAY_URL";
pub const ENV_SERVICE: &str = "MORAY_SERVICE";

#[derive(FromArgs, Debug)]
/// Moray client tools
pub struct Cli {
    /// hostname or IP address of a moray server
    #[argh(option, short = 'H')]
    pub host: Option<String>,

    /// TCP port of a moray server
    #[argh(option, short = 'p')]
    pub port: Option<String>,

    /// service domain to discover moray servers through DNS
    #[argh(option, short = 'S')]
    pub service: Option<String>,

    /// log debug output to stderr
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    #[argh(subcommand)]
    pub command: Commands,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand)]
pub enum Commands {
    Ping(PingArgs),
    Version(VersionArgs),
    GetBucket(GetBucketArgs),
    ListBuckets(ListBucketsArgs),
    PutBucket(PutBucketArgs),
    DelBucket(DelBucketArgs),
    GetObject(GetObjectArgs),
    PutObject(PutObjectArgs),
    DelObject(DelObjectArgs),
    Find(FindArgs),
    Sql(SqlArgs),
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "ping")]
/// check that the server is up
pub struct PingArgs {
    /// also check the server's database connection
    #[argh(switch, short = 'd')]
    pub deep: bool,

    /// request timeout in milliseconds
    #[argh(option, short = 't')]
    pub timeout_ms: Option<u64>,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "version")]
/// print the server's API version
pub struct VersionArgs {}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "getbucket")]
/// print a bucket's configuration
pub struct GetBucketArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "listbuckets")]
/// print every bucket's configuration
pub struct ListBucketsArgs {}

/// Creates a bucket or brings an existing one up to date.
///
/// Indexes are given as `FIELD:TYPE`, for example `email:string`.
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "putbucket")]
/// create or update a bucket
pub struct PutBucketArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,

    /// index a field, as FIELD:TYPE
    #[argh(option, short = 'x', long = "index")]
    pub indexes: Vec<String>,

    /// index a field with a uniqueness constraint, as FIELD:TYPE
    #[argh(option, short = 'u', long = "unique")]
    pub unique: Vec<String>,

    /// bucket configuration version
    #[argh(option, short = 'V', long = "bucket-version")]
    pub version: Option<u64>,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "delbucket")]
/// delete a bucket and its objects
pub struct DelBucketArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "getobject")]
/// print one object
pub struct GetObjectArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
    /// object key
    #[argh(positional)]
    pub key: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "putobject")]
/// store a JSON object
pub struct PutObjectArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
    /// object key
    #[argh(positional)]
    pub key: String,
    /// object value as a JSON document
    #[argh(positional)]
    pub value: String,

    /// only write if the stored object has this etag
    #[argh(option, short = 'e')]
    pub etag: Option<String>,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "delobject")]
/// delete one object
pub struct DelObjectArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
    /// object key
    #[argh(positional)]
    pub key: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "find")]
/// print the objects matching a filter
pub struct FindArgs {
    /// bucket name
    #[argh(positional)]
    pub bucket: String,
    /// LDAP-style search filter
    #[argh(positional)]
    pub filter: String,

    /// maximum number of objects to return
    #[argh(option, short = 'l')]
    pub limit: Option<u64>,

    /// number of matching objects to skip
    #[argh(option, short = 'o')]
    pub offset: Option<u64>,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "sql")]
/// run a SQL statement and print the rows
pub struct SqlArgs {
    /// SQL statement to run
    #[argh(positional)]
    pub statement: String,

    /// statement parameters as a JSON array
    #[argh(option, short = 'a', long = "values", default = "\"[]\".into()")]
    pub values: String,
}

/// The server (or servers) a command talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Direct { host: String, port: u16 },
    Service { domain: String },
}

/// Parses a TCP port number.
pub fn parse_tcp_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| anyhow!("-p/--port: expected valid TCP port, got {:?}", value))
}

fn validate_service(domain: &str) -> Result<()> {
    if domain.parse::<IpAddr>().is_ok() {
        bail!("cannot use an IP address with -S/--service/{}", ENV_SERVICE);
    }
    Ok(())
}

/// Host and port taken from `MORAY_URL`, if it is set.
fn url_target(env: &dyn Fn(&str) -> Option<String>) -> Result<(Option<String>, Option<u16>)> {
    let Some(raw) = env(ENV_URL).filter(|v| !v.is_empty()) else {
        return Ok((None, None));
    };
    let url = Url::parse(&raw).with_context(|| format!("{} is not a valid URL", ENV_URL))?;
    let host = url.host_str().map(str::to_string);
    Ok((host, url.port()))
}

/// Decides which server to talk to from the command-line flags and the
/// environment, looked up through `env`.
pub fn resolve_target(
    host: Option<&str>,
    port: Option<&str>,
    service: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Target> {
    let port = port.map(parse_tcp_port).transpose()?;

    if let Some(domain) = service {
        if host.is_some() || port.is_some() {
            bail!("-S/--service cannot be combined with -H/--host or -p/--port");
        }
        validate_service(domain)?;
        return Ok(Target::Service {
            domain: domain.to_string(),
        });
    }

    if let (Some(host), Some(port)) = (host, port) {
        return Ok(Target::Direct {
            host: host.to_string(),
            port,
        });
    }

    if host.is_none() && port.is_none() {
        if let Some(domain) = env(ENV_SERVICE).filter(|v| !v.is_empty()) {
            validate_service(&domain)?;
            return Ok(Target::Service { domain });
        }
    }

    let (url_host, url_port) = url_target(&env)?;
    Ok(Target::Direct {
        host: host
            .map(str::to_string)
            .or(url_host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: port.or(url_port).unwrap_or(DEFAULT_PORT),
    })
}

/// Client options for a command-line invocation.
///
/// Single servers get no connection retries so that an unreachable server
/// fails the command quickly.
pub fn client_options(target: &Target) -> Result<ClientOptions> {
    let options = match target {
        Target::Direct { host, port } => {
            ClientOptions::from_legacy(LegacyOptions::with_host(host.clone(), *port))
        }
        Target::Service { domain } => {
            let config = PoolConfig::new(domain.clone(), DEFAULT_PORT, &Defaults::HISTORICAL)?;
            ClientOptions::from_pool_config(config)
        }
    };
    Ok(options.must_close_before_exit(true))
}

/// Default log filter when `RUST_LOG` is unset.
pub fn log_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "warn"
    }
}

fn parse_index(spec: &str) -> Result<(String, IndexSpec)> {
    match spec.split_once(':') {
        Some((field, kind)) if !field.is_empty() && !kind.is_empty() => {
            Ok((field.to_string(), IndexSpec::new(kind)))
        }
        _ => bail!("index must be given as FIELD:TYPE, got {:?}", spec),
    }
}

/// Builds the bucket configuration described by `putbucket` flags.
pub fn bucket_config(args: &PutBucketArgs) -> Result<BucketConfig> {
    let mut config = BucketConfig::default();
    for spec in &args.indexes {
        let (field, index) = parse_index(spec)?;
        config = config.with_index(field, index);
    }
    for spec in &args.unique {
        let (field, index) = parse_index(spec)?;
        config = config.with_index(field, index.unique());
    }
    if let Some(version) = args.version {
        config = config.with_version(version);
    }
    Ok(config)
}

/// Request options for a `find` invocation.
pub fn find_options(args: &FindArgs) -> RequestOptions {
    let mut opts = RequestOptions::new();
    if let Some(limit) = args.limit {
        opts = opts.set("limit", limit);
    }
    if let Some(offset) = args.offset {
        opts = opts.set("offset", offset);
    }
    opts
}

/// Request options for a `ping` invocation.
pub fn ping_options(args: &PingArgs) -> RequestOptions {
    match args.timeout_ms {
        Some(ms) => RequestOptions::new().with_timeout(Duration::from_millis(ms)),
        None => RequestOptions::new(),
    }
}
