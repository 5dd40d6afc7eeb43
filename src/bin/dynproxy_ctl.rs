//! CLI tool for managing routes, redirect rules and certificates
//!
//! Usage:
//!   dynproxy-ctl route add <host> <upstream> [--prefix <path>] [--skip-tls-verify]
//!   dynproxy-ctl route update <id> [--upstream <url>] [--skip-tls-verify <bool>]
//!   dynproxy-ctl route delete <host> [--prefix <path>]
//!   dynproxy-ctl route list [--host <host>] [--json]
//!   dynproxy-ctl redirect add <match-prefix> <target> [--forward-child-path] [--status <code>]
//!   dynproxy-ctl redirect delete <match-prefix>
//!   dynproxy-ctl redirect list [--json]
//!   dynproxy-ctl cert inspect <file>
//!   dynproxy-ctl cert scan

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dynproxy::inspect::{self, ExpiryStatus};
use dynproxy::{CertificateStore, ProxyRoute, RedirectRuleTable, RouteStore};
use std::fs;
use std::path::{Path, PathBuf};

/// CLI tool for managing Dynproxy configuration
#[derive(Parser, Debug)]
#[command(name = "dynproxy-ctl")]
#[command(author = "Dynproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage routes, redirect rules and certificates for Dynproxy")]
struct Args {
    /// Route database path
    #[arg(long, env = "DB_PATH", default_value = "./data/routes.db")]
    db_path: PathBuf,

    /// Redirect rule directory
    #[arg(long, env = "REDIRECT_DIR", default_value = "./conf/redirect")]
    redirect_dir: PathBuf,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage proxy routes
    #[command(subcommand)]
    Route(RouteCommand),

    /// Manage redirect rules
    #[command(subcommand)]
    Redirect(RedirectCommand),

    /// Inspect certificates
    #[command(subcommand)]
    Cert(CertCommand),
}

#[derive(Subcommand, Debug)]
enum RouteCommand {
    /// Add a route
    Add {
        /// Host name (e.g., api.example.com)
        host: String,

        /// Upstream origin (e.g., http://127.0.0.1:3000)
        upstream: String,

        /// Virtual directory the route is mounted under
        #[arg(short = 'p', long, default_value = "")]
        prefix: String,

        /// Accept invalid upstream TLS certificates
        #[arg(long)]
        skip_tls_verify: bool,
    },

    /// Update a route by id
    Update {
        id: String,

        #[arg(short = 'u', long)]
        upstream: Option<String>,

        #[arg(long)]
        skip_tls_verify: Option<bool>,
    },

    /// Delete routes of a host
    Delete {
        host: String,

        /// Only delete the route mounted under this prefix
        #[arg(short = 'p', long)]
        prefix: Option<String>,
    },

    /// List routes
    List {
        /// Filter by host
        #[arg(long)]
        host: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RedirectCommand {
    /// Add or replace a redirect rule
    Add {
        /// URL prefix to match, with or without host (e.g., example.com/old)
        match_prefix: String,

        /// Redirect target
        target: String,

        /// Append the remainder of the request URL to the target
        #[arg(long)]
        forward_child_path: bool,

        /// Redirect status code
        #[arg(long, default_value = "307")]
        status: u16,
    },

    /// Delete a redirect rule
    Delete { match_prefix: String },

    /// List redirect rules
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// Show domains, issuer and expiry of a PEM certificate file
    Inspect { file: PathBuf },

    /// Report stored certificates that need renewal
    Scan,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Route(command) => {
            let store = RouteStore::new(&args.db_path)?;
            run_route_command(&store, command)?;
        }
        Commands::Redirect(command) => {
            let table = RedirectRuleTable::load(&args.redirect_dir)?;
            run_redirect_command(&table, command)?;
        }
        Commands::Cert(command) => run_cert_command(&args.certs_dir, command)?,
    }

    Ok(())
}

fn run_route_command(store: &RouteStore, command: RouteCommand) -> Result<()> {
    match command {
        RouteCommand::Add {
            host,
            upstream,
            prefix,
            skip_tls_verify,
        } => {
            let route = store.add_route(&host, &prefix, &upstream, skip_tls_verify)?;
            println!("Added route:");
            print_route(&route);
        }

        RouteCommand::Update {
            id,
            upstream,
            skip_tls_verify,
        } => {
            if store.update_route(&id, upstream.as_deref(), skip_tls_verify)? {
                println!("Updated route {}", id);
            } else {
                eprintln!("No route updated for id {}", id);
                std::process::exit(1);
            }
        }

        RouteCommand::Delete { host, prefix } => {
            let deleted = store.delete_route(&host, prefix.as_deref())?;
            if deleted > 0 {
                println!("Deleted {} route(s) for {}", deleted, host);
            } else {
                eprintln!("No routes found for {}", host);
                std::process::exit(1);
            }
        }

        RouteCommand::List { host, json } => {
            let routes = store.list_routes(host.as_deref())?;

            if routes.is_empty() {
                match host {
                    Some(host) => println!("No routes found for host: {}", host),
                    None => println!("No routes found"),
                }
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = routes
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "id": r.id,
                            "host": r.host,
                            "path_prefix": r.path_prefix,
                            "upstream": r.upstream,
                            "skip_tls_verify": r.skip_tls_verify,
                            "created_at": r.created_at,
                            "updated_at": r.updated_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<40} {:<20} {:<40} {:<6}", "HOST", "PREFIX", "UPSTREAM", "VERIFY");
                println!("{}", "-".repeat(108));

                for route in &routes {
                    println!(
                        "{:<40} {:<20} {:<40} {:<6}",
                        route.host,
                        format!("/{}", route.path_prefix),
                        route.upstream,
                        if route.skip_tls_verify { "no" } else { "yes" }
                    );
                }

                println!("\nTotal: {} route(s)", routes.len());
            }
        }
    }

    Ok(())
}

fn run_redirect_command(table: &RedirectRuleTable, command: RedirectCommand) -> Result<()> {
    match command {
        RedirectCommand::Add {
            match_prefix,
            target,
            forward_child_path,
            status,
        } => {
            table.add(&match_prefix, &target, forward_child_path, status)?;
            println!("Saved redirect {} -> {} ({})", match_prefix, target, status);
        }

        RedirectCommand::Delete { match_prefix } => {
            table.delete(&match_prefix)?;
            println!("Deleted redirect {}", match_prefix);
        }

        RedirectCommand::List { json } => {
            let rules = table.list_all();

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }

            if rules.is_empty() {
                println!("No redirect rules found");
                return Ok(());
            }

            println!("{:<40} {:<50} {:<6} {:<6}", "MATCH", "TARGET", "CHILD", "CODE");
            println!("{}", "-".repeat(105));
            for rule in &rules {
                println!(
                    "{:<40} {:<50} {:<6} {:<6}",
                    rule.match_prefix,
                    rule.target_url,
                    if rule.forward_child_path { "yes" } else { "no" },
                    rule.status_code
                );
            }
            println!("\nTotal: {} rule(s)", rules.len());
        }
    }

    Ok(())
}

fn run_cert_command(certs_dir: &Path, command: CertCommand) -> Result<()> {
    match command {
        CertCommand::Inspect { file } => {
            let pem = fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;

            let domains = inspect::extract_domains(&pem)?;
            let issuer = inspect::extract_issuer_name(&pem)
                .unwrap_or_else(|e| format!("unknown ({})", e));

            println!("  File:     {}", file.display());
            println!("  Domains:  {}", domains.join(", "));
            println!("  Issuer:   {}", issuer);
            println!("  Status:   {}", describe_status(inspect::expiry_status(&pem)));
        }

        CertCommand::Scan => {
            let store = CertificateStore::new(certs_dir)?;
            let candidates = store.scan_for_renewal()?;

            if candidates.is_empty() {
                println!("All certificates are valid");
                return Ok(());
            }

            for candidate in &candidates {
                println!("{:<50} {}", candidate.name, describe_status(candidate.status));
            }
            println!("\nTotal: {} certificate(s) need renewal", candidates.len());
        }
    }

    Ok(())
}

fn describe_status(status: ExpiryStatus) -> &'static str {
    match status {
        ExpiryStatus::Valid => "valid",
        ExpiryStatus::ExpiringSoon => "expiring soon",
        ExpiryStatus::Expired => "expired",
        ExpiryStatus::Unknown => "unreadable",
    }
}

fn print_route(route: &ProxyRoute) {
    println!("  ID:         {}", route.id);
    println!("  Host:       {}", route.host);
    println!("  Prefix:     /{}", route.path_prefix);
    println!("  Upstream:   {}", route.upstream);
    println!("  Verify TLS: {}", !route.skip_tls_verify);
    println!("  Created:    {}", route.created_at);
}
