use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use sentinel_engine::phishing::PhishingUrlAnalyzer;
use sentinel_engine::policy_store::{PolicyFilter, PolicyStore, RelationshipType};
use sentinel_engine::SentinelConfig;
use std::process;

fn main() {
    let matches = Command::new("sentinel-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Administration tool for the Sentinel policy store")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true)
                .default_value("sentinel.yaml"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("FILE")
                .help("Policy database path (overrides the configuration)")
                .global(true)
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .global(true)
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(clap::ArgAction::Set),
        )
        .subcommand(Command::new("status").about("Show store health, counts and cache metrics"))
        .subcommand(
            Command::new("list-policies")
                .about("List policies")
                .arg(
                    Arg::new("include-expired")
                        .long("include-expired")
                        .help("Include expired policies")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("show-policy")
                .about("Show one policy as JSON")
                .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
        )
        .subcommand(
            Command::new("list-relationships")
                .about("List credential relationships")
                .arg(
                    Arg::new("type")
                        .long("type")
                        .value_name("TYPE")
                        .help("Only show trusted or blocked relationships")
                        .value_parser(["trusted", "blocked"]),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Export policies and relationships as JSON")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("import")
                .about("Import policies and relationships from JSON")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(Command::new("cleanup").about("Remove expired policies, relationships and old threats"))
        .subcommand(Command::new("verify").about("Run the integrity check"))
        .subcommand(Command::new("vacuum").about("Compact the database file"))
        .subcommand(Command::new("seed-templates").about("Install the built-in policy templates"))
        .subcommand(Command::new("list-templates").about("List policy templates"))
        .subcommand(
            Command::new("analyze-url")
                .about("Run the phishing analyzer on a URL")
                .arg(Arg::new("url").required(true)),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        generate_default_config(path);
        return;
    }

    if let Err(e) = run(&matches) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("sentinel.yaml");
    let config = SentinelConfig::load_or_default(config_path);

    if let Some(("analyze-url", sub)) = matches.subcommand() {
        let url = sub.get_one::<String>("url").context("url is required")?;
        let analysis = PhishingUrlAnalyzer::new(&config.phishing).analyze_url(url);
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    let db_path = matches
        .get_one::<String>("database")
        .cloned()
        .unwrap_or_else(|| config.database_path.clone());
    let store = PolicyStore::open(&db_path, &config)?;

    match matches.subcommand() {
        Some(("status", _)) | None => show_status(&store, &db_path)?,
        Some(("list-policies", sub)) => {
            let filter = PolicyFilter {
                include_expired: sub.get_flag("include-expired"),
                ..Default::default()
            };
            let policies = store.list_policies(&filter)?;
            if policies.is_empty() {
                println!("No policies");
            }
            for p in policies {
                let target = p
                    .file_hash
                    .as_deref()
                    .or(p.url_pattern.as_deref())
                    .unwrap_or("*");
                println!(
                    "{:>5}  {:<14} {:<16} {:>6}  {:<40} {}",
                    p.id,
                    p.action,
                    p.match_type,
                    p.hit_count,
                    truncate_string(&p.rule_name, 40),
                    target
                );
            }
        }
        Some(("show-policy", sub)) => {
            let id = *sub.get_one::<i64>("id").context("id is required")?;
            let policy = store.get_policy(id)?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }
        Some(("list-relationships", sub)) => {
            let filter = sub
                .get_one::<String>("type")
                .map(|t| t.parse::<RelationshipType>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            for rel in store.list_relationships(filter)? {
                println!(
                    "{:>5}  {:<8} {} -> {}  (used {} times)",
                    rel.id, rel.relationship_type, rel.form_origin, rel.action_origin, rel.use_count
                );
            }
        }
        Some(("export", sub)) => {
            let file = sub.get_one::<String>("file").context("file is required")?;
            let bytes = store.export_json()?;
            std::fs::write(file, bytes).with_context(|| format!("Failed to write {file}"))?;
            println!("Exported to {file}");
        }
        Some(("import", sub)) => {
            let file = sub.get_one::<String>("file").context("file is required")?;
            let bytes = std::fs::read(file).with_context(|| format!("Failed to read {file}"))?;
            let summary = store.import_json(&bytes)?;
            println!(
                "Imported {} policies and {} relationships ({} duplicate relationships skipped)",
                summary.policies_imported,
                summary.relationships_imported,
                summary.relationships_skipped
            );
        }
        Some(("cleanup", _)) => {
            let report = store.cleanup_expired()?;
            let threats = store.cleanup_old_threats(config.threat_retention_days)?;
            println!(
                "Removed {} expired policies, {} expired relationships, {} old threats",
                report.policies_removed, report.relationships_removed, threats
            );
        }
        Some(("verify", _)) => match store.verify_integrity() {
            Ok(()) => println!("Integrity check passed"),
            Err(e) => anyhow::bail!("Integrity check failed: {e}"),
        },
        Some(("vacuum", _)) => {
            store.vacuum()?;
            println!("Vacuum complete");
        }
        Some(("seed-templates", _)) => {
            let added = store.seed_builtin_templates()?;
            println!("Installed {added} built-in templates");
        }
        Some(("list-templates", _)) => {
            for t in store.list_templates(None)? {
                let vars: Vec<&str> = t.variables.iter().map(|v| v.name.as_str()).collect();
                println!(
                    "{:>4}  {:<40} [{}]{}  {}",
                    t.id,
                    t.name,
                    t.category,
                    if t.is_builtin { " builtin" } else { "" },
                    vars.join(", ")
                );
            }
        }
        Some((other, _)) => anyhow::bail!("Unknown command: {other}"),
    }
    Ok(())
}

fn show_status(store: &PolicyStore, db_path: &str) -> anyhow::Result<()> {
    println!("Database: {db_path}");
    println!("Healthy: {}", store.is_healthy());
    println!("Policies: {}", store.policy_count()?);
    println!(
        "Relationships: {} trusted, {} blocked",
        store.list_relationships(Some(RelationshipType::Trusted))?.len(),
        store.list_relationships(Some(RelationshipType::Blocked))?.len()
    );
    println!("Threats recorded: {}", store.threat_count()?);
    let metrics = store.cache_metrics();
    println!(
        "Cache: {} hits, {} misses, {} invalidations (generation {})",
        metrics.hits, metrics.misses, metrics.invalidations, metrics.generation
    );
    Ok(())
}

fn generate_default_config(path: &str) {
    match SentinelConfig::default().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
