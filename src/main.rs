//! Demo entry point
//!
//! Without arguments: builds a `users` table in an in-memory SQLite database
//! and prints the result of each explorer helper.
//!
//! `sql_explorer --config <path> <table>` or `DATABASE_URL=... sql_explorer <table>`
//! connects to that database instead and prints the first rows of `<table>`.

use anyhow::{bail, Context, Result};
use sql_explorer::config::SqliteConfig;
use sql_explorer::{params, BackendKind, DatabaseExplorer, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PREVIEW_ROWS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut table = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = Some(args.next().context("--config needs a path")?);
            }
            "-h" | "--help" => {
                println!("usage: sql_explorer [--config <path>] [<table>]");
                return Ok(());
            }
            _ if table.is_none() => table = Some(arg),
            other => bail!("unexpected argument: {}", other),
        }
    }

    let settings = match config_path {
        Some(path) => Some(Settings::load(&path).with_context(|| format!("loading {}", path))?),
        None if std::env::var_os("DATABASE_URL").is_some() => Some(Settings::from_env()?),
        None => None,
    };

    match settings {
        Some(settings) => {
            let table = table.context("a table name is required with --config / DATABASE_URL")?;
            preview(&settings, &table).await
        }
        None => demo().await,
    }
}

async fn preview(settings: &Settings, table: &str) -> Result<()> {
    let explorer = DatabaseExplorer::from_settings(settings).await?;
    let outcome = async {
        println!("{} rows in {}", explorer.count(table).await?, table);
        for row in explorer.find_all(table, Some(PREVIEW_ROWS)).await? {
            println!("  {}", serde_json::to_string(&row)?);
        }
        anyhow::Ok(())
    }
    .await;
    explorer.close().await?;
    outcome
}

async fn demo() -> Result<()> {
    let explorer = DatabaseExplorer::connect(BackendKind::SQLite, SqliteConfig::in_memory()).await?;
    let outcome = run_demo(&explorer).await;
    explorer.close().await?;
    outcome
}

async fn run_demo(explorer: &DatabaseExplorer) -> Result<()> {
    explorer
        .execute(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE,
                age INTEGER
            )",
            &params!(),
        )
        .await?;

    let insert = "INSERT INTO users (name, email, age) VALUES (:name, :email, :age)";
    for (name, email, age) in [
        ("Alice", "alice@example.com", 30),
        ("Bob", "bob@example.com", 25),
        ("Charlie", "charlie@example.com", 35),
    ] {
        explorer
            .execute(insert, &params! { "name" => name, "email" => email, "age" => age })
            .await?;
    }

    println!("Users older than 26:");
    let users = explorer
        .fetch_all("SELECT * FROM users WHERE age > :min_age", &params! { "min_age" => 26 })
        .await?;
    for user in &users {
        println!("  {} ({})", user["name"], user["age"]);
    }

    println!("\nFind user by email:");
    match explorer
        .fetch_one(
            "SELECT * FROM users WHERE email = :email",
            &params! { "email" => "bob@example.com" },
        )
        .await?
    {
        Some(user) => println!("  Found: {}", user["name"]),
        None => println!("  Not found"),
    }

    println!("\nConvenience methods:");
    println!("  Total users: {}", explorer.count("users").await?);
    if let Some(user) = explorer.find_by_id("users", "id", 1).await? {
        println!("  User #1: {}", user["name"]);
    }
    println!("  Has Alice? {}", explorer.exists("users", "name", "Alice").await?);
    println!("  Has Dave? {}", explorer.exists("users", "name", "Dave").await?);

    println!("\nAs JSON:");
    println!("{}", serde_json::to_string_pretty(&explorer.find_all("users", None).await?)?);

    Ok(())
}
