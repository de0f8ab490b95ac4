use ssdb::clock::to_micros;
use ssdb::config::SharedStorageConfig;
use ssdb::{InitStatus, OperationResult, Origin, SharedStorageDatabase, Site};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let rest = &args[2..];
    match args[1].as_str() {
        "origins" => cmd_origins(rest),
        "entries" => cmd_entries(rest),
        "budget" => cmd_budget(rest),
        "purge-stale" => cmd_purge_stale(rest),
        "clear" => cmd_clear(rest),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_origins(args: &[String]) -> Result<(), String> {
    let mut db = open_database(args)?;
    for usage in db.fetch_origins() {
        println!(
            "{}\t{}\t{}",
            usage.origin,
            usage.num_bytes,
            to_micros(usage.creation_time)
        );
    }
    ensure_usable(&db)
}

fn cmd_entries(args: &[String]) -> Result<(), String> {
    let origin = parse_origin(args)?;
    let mut db = open_database(args)?;
    let listing = db.get_entries_for_dev_tools(&origin);
    check_result("entries", listing.result)?;
    for (key, value) in listing.entries {
        println!("{key}\t{value}");
    }
    Ok(())
}

fn cmd_budget(args: &[String]) -> Result<(), String> {
    let site = parse_flag_value(args, "--site").ok_or("--site is required")?;
    let site = Site::parse(&site).map_err(|e| e.to_string())?;
    let mut db = open_database(args)?;
    let budget = db.get_remaining_budget(&site);
    check_result("budget", budget.result)?;
    println!(
        "{}\t{}\t{}",
        site,
        budget.bits,
        db.num_budget_entries_for_testing(&site)
    );
    Ok(())
}

fn cmd_purge_stale(args: &[String]) -> Result<(), String> {
    let mut db = open_database(args)?;
    check_result("purge-stale", db.purge_stale())?;
    println!("ok");
    Ok(())
}

fn cmd_clear(args: &[String]) -> Result<(), String> {
    let origin = parse_origin(args)?;
    let mut db = open_database(args)?;
    check_result("clear", db.clear(&origin))?;
    println!("ok\t{origin}");
    Ok(())
}

fn open_database(args: &[String]) -> Result<SharedStorageDatabase, String> {
    let path = parse_flag_value(args, "--db").ok_or("--db is required")?;
    let config = match parse_flag_value(args, "--config") {
        Some(config_path) => SharedStorageConfig::from_json_file(Path::new(&config_path))
            .map_err(|e| format!("load config: {e}"))?,
        None => SharedStorageConfig::default(),
    };
    SharedStorageDatabase::new(Some(PathBuf::from(path)), config)
        .map_err(|e| format!("open database: {e}"))
}

fn parse_origin(args: &[String]) -> Result<Origin, String> {
    let origin = parse_flag_value(args, "--origin").ok_or("--origin is required")?;
    Origin::parse(&origin).map_err(|e| e.to_string())
}

fn check_result(command: &str, result: OperationResult) -> Result<(), String> {
    match result {
        OperationResult::Success => Ok(()),
        other => Err(format!("{command}: {other}")),
    }
}

fn ensure_usable(db: &SharedStorageDatabase) -> Result<(), String> {
    match db.db_status() {
        InitStatus::Success | InitStatus::Unattempted => Ok(()),
        status => Err(format!("database failed to initialize: {status:?}")),
    }
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  ssdb origins --db <file> [--config <json>]");
    eprintln!("  ssdb entries --db <file> --origin <origin> [--config <json>]");
    eprintln!("  ssdb budget --db <file> --site <site> [--config <json>]");
    eprintln!("  ssdb purge-stale --db <file> [--config <json>]");
    eprintln!("  ssdb clear --db <file> --origin <origin> [--config <json>]");
}
