//! # Moray CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Check a local server
//! moray ping
//!
//! # Talk to every server of a service
//! moray -S 1.moray.example.com listbuckets
//!
//! # Create a bucket, store an object and find it again
//! moray putbucket -u email:string users
//! moray putobject users alice '{"email": "alice@example.com"}'
//! moray find users '(email=alice@example.com)'
//! ```

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use moray_cli::{
    bucket_config, client_options, find_options, log_filter, ping_options, resolve_target, Cli,
    Commands,
};
use moray_client::{MorayClient, RecordStream, RequestOptions};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so stdout stays clean JSON
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_filter(cli.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let target = resolve_target(
        cli.host.as_deref(),
        cli.port.as_deref(),
        cli.service.as_deref(),
        |name| std::env::var(name).ok(),
    )?;
    tracing::debug!("Using {:?}", target);

    let client = MorayClient::new(client_options(&target)?)?;
    let result = run(&client, cli.command).await;
    client.close().await;
    result
}

async fn run(client: &MorayClient, command: Commands) -> Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, client.wait_connected())
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", client))??;

    let opts = RequestOptions::new();
    match command {
        Commands::Ping(args) => {
            client.ping(args.deep, &ping_options(&args)).await?;
            tracing::info!("{} is up", client);
        }
        Commands::Version(_) => {
            print_json(&client.version(&opts).await?)?;
        }
        Commands::GetBucket(args) => {
            print_json(&client.get_bucket(&args.bucket, &opts).await?)?;
        }
        Commands::ListBuckets(_) => {
            for bucket in client.list_buckets(&opts).await? {
                print_json(&bucket)?;
            }
        }
        Commands::PutBucket(args) => {
            let config = bucket_config(&args)?;
            client.put_bucket(&args.bucket, &config, &opts).await?;
        }
        Commands::DelBucket(args) => {
            client.delete_bucket(&args.bucket, &opts).await?;
        }
        Commands::GetObject(args) => {
            print_json(&client.get_object(&args.bucket, &args.key, &opts).await?)?;
        }
        Commands::PutObject(args) => {
            let value: Value = serde_json::from_str(&args.value)
                .map_err(|e| anyhow!("Invalid JSON in object value: {}", e))?;
            let opts = match args.etag {
                Some(etag) => opts.set("etag", etag),
                None => opts,
            };
            client.put_object(&args.bucket, &args.key, &value, &opts).await?;
        }
        Commands::DelObject(args) => {
            client.delete_object(&args.bucket, &args.key, &opts).await?;
        }
        Commands::Find(args) => {
            let stream = client.find_objects(&args.bucket, &args.filter, &find_options(&args));
            print_stream(stream).await?;
        }
        Commands::Sql(args) => {
            let values: Vec<Value> = serde_json::from_str(&args.values)
                .context("--values must be a JSON array")?;
            print_stream(client.sql(&args.statement, values, &opts)).await?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn print_stream(mut stream: RecordStream) -> Result<()> {
    while let Some(record) = stream.next().await {
        print_json(&record?)?;
    }
    Ok(())
}
