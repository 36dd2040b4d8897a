//! Operator tool: mint a bearer credential for a requester.
//!
//! Usage:
//!   GENFLOW_AUTH_SECRET=... cargo run --bin mint-token -- did:plc:alice --ttl-secs 3600
//!
//! Prints the credential on stdout, for use as `Authorization: Bearer <token>`
//! or as the `?token=` query parameter of the stream endpoint.

use std::time::Duration;

use clap::Parser;
use genflow_server::auth::Authenticator;
use genflow_server::model::now_secs;

#[derive(Parser)]
struct Args {
    /// Requester id the credential is issued to.
    requester: String,

    /// Credential lifetime in seconds.
    #[arg(long, default_value_t = 86_400)]
    ttl_secs: u64,

    /// Shared signing secret (must match the server's).
    #[arg(long, env = "GENFLOW_AUTH_SECRET", hide_env_values = true)]
    auth_secret: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let auth = Authenticator::new(&args.auth_secret);
    let token = auth.mint(&args.requester, Duration::from_secs(args.ttl_secs), now_secs())?;
    tracing::info!(requester = %args.requester, ttl_secs = args.ttl_secs, "Minted credential");
    println!("{token}");
    Ok(())
}
