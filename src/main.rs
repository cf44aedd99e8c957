use std::path::PathBuf;

use ballista::capture::{CaptureSink, SqliteSink};
use ballista::config::ProxyConfig;
use ballista::redirect::Policy;
use ballista::scanner::{self, Scanner};
use ballista::server::ProxyServer;
use ballista::{Error, Result};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ballista")]
#[command(about = "An intercepting HTTP/HTTPS proxy that captures traffic", long_about = None)]
struct Args {
  #[command(subcommand)]
  command: Command,

  /// Path to a TOML configuration file
  #[arg(short, long, value_name = "FILE", global = true)]
  config: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long, global = true)]
  debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
  /// Run the proxy
  Run {
    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    addr: Option<String>,
    /// Host key paired with every minted certificate
    #[arg(long, value_name = "PATH")]
    key: Option<PathBuf>,
    /// Capture database
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Also capture traffic inside intercepted tunnels
    #[arg(long)]
    capture_tunnel: bool,
  },
  /// List captured requests
  List,
  /// Show a captured request and the response linked to it
  Show {
    /// Request id in the capture database
    id: i64,
  },
  /// Send a captured request again and print the response
  Replay {
    /// Request id in the capture database
    id: i64,
    /// Follow up to 10 redirects
    #[arg(long)]
    follow_redirects: bool,
  },
  /// Probe wordlist paths on the origin of a captured request
  Scan {
    /// Request id in the capture database
    id: i64,
    /// One path per line
    #[arg(long, value_name = "FILE")]
    wordlist: PathBuf,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  let log_level = if args.debug { "debug" } else { "info" };
  let directive = format!("ballista={log_level}")
    .parse::<tracing_subscriber::filter::Directive>()
    .map_err(|e| Error::Config(format!("invalid log directive: {e}")))?;
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
    .init();

  let mut config = ProxyConfig::load(args.config.as_deref())?;
  match args.command {
    Command::Run {
      addr,
      key,
      database,
      capture_tunnel,
    } => {
      if let Some(addr) = addr {
        config.listen_addr = addr;
      }
      if let Some(key) = key {
        config.host_key_path = key;
      }
      if let Some(database) = database {
        config.database_path = database;
      }
      config.capture_tunnel |= capture_tunnel;
      info!(
        "capturing to {} (tunnel capture {})",
        config.database_path.display(),
        if config.capture_tunnel { "on" } else { "off" }
      );
      let server = ProxyServer::from_config(&config).await?;
      server.run(&config.listen_addr).await
    }
    Command::List => list(&config).await,
    Command::Show { id } => show(&config, id).await,
    Command::Replay {
      id,
      follow_redirects,
    } => replay(&config, id, follow_redirects).await,
    Command::Scan { id, wordlist } => scan(&config, id, &wordlist).await,
  }
}

async fn list(config: &ProxyConfig) -> Result<()> {
  let sink = SqliteSink::open(&config.database_path)?;
  let requests = sink.list_requests().await?;
  if requests.is_empty() {
    return Err(Error::Other("no requests found".to_string()));
  }
  for record in requests {
    let response = match record.response_id {
      Some(id) => id.to_string(),
      None => "-".to_string(),
    };
    println!("{}\t{}\t{}\tresponse={}", record.id, record.method, record.url, response);
  }
  Ok(())
}

async fn show(config: &ProxyConfig, id: i64) -> Result<()> {
  let sink = SqliteSink::open(&config.database_path)?;
  let request = sink
    .get_request_record(id)
    .await?
    .ok_or_else(|| Error::Other(format!("no captured request with id {id}")))?;
  println!("{}", serde_json::to_string_pretty(&request)?);
  if let Some(response) = sink.get_response_by_request_id(id).await? {
    println!("{}", serde_json::to_string_pretty(&response)?);
  }
  Ok(())
}

async fn replay(config: &ProxyConfig, id: i64, follow_redirects: bool) -> Result<()> {
  let sink = SqliteSink::open(&config.database_path)?;
  let request = sink
    .get_request(id)
    .await?
    .ok_or_else(|| Error::Other(format!("no captured request with id {id}")))?;
  let policy = if follow_redirects {
    Policy::limited(10)
  } else {
    Policy::none()
  };
  let client = config.upstream.client_builder(policy).await?.build()?;
  info!("replaying {} {}", request.method(), request.uri());
  let response = client.execute(request).await?;
  println!("{:?} {}", response.version(), response.status_code());
  for (name, value) in response.headers() {
    println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
  }
  println!();
  println!("{}", response.text());
  Ok(())
}

async fn scan(config: &ProxyConfig, id: i64, wordlist: &std::path::Path) -> Result<()> {
  let sink = SqliteSink::open(&config.database_path)?;
  let url = sink
    .get_request_url(id)
    .await?
    .ok_or_else(|| Error::Other(format!("no captured request with id {id}")))?;
  let words = scanner::load_wordlist(wordlist).await?;
  let client = config.upstream.client_builder(Policy::none()).await?.build()?;
  let scanner = Scanner::new(client, &url)?;
  info!("scanning {} with {} paths", scanner.origin(), words.len());
  let findings = scanner.dirbust(&words).await;
  if findings.is_empty() {
    println!("no paths found");
    return Ok(());
  }
  for finding in findings {
    println!("{} - {}", finding.url, finding.status_code);
    if let Some(body) = finding.body {
      println!("{body}");
    }
    println!();
  }
  Ok(())
}
