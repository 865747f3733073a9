//! CLI entry point for quorumlite-ctl: cluster administration and ad-hoc SQL.

use clap::{Parser, Subcommand};
use quorumlite::client::{Client, ClientError};
use quorumlite::cluster::membership::Role;
use quorumlite::fsm::engine::{QueryResult, Value};

#[derive(Parser)]
#[command(name = "quorumlite-ctl", about = "quorumlite cluster and SQL client")]
struct Cli {
    /// Comma-separated node addresses (host:port); the leader is located
    /// through redirect hints.
    #[arg(long, default_value = "127.0.0.1:9001", value_delimiter = ',')]
    servers: Vec<String>,

    /// Database to open for `exec` and `query`.
    #[arg(long, default_value = "main")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a node as a spare
    Add { id: u64, address: String },
    /// Assign a role (voter, standby, spare) to a node
    Assign {
        id: u64,
        #[arg(value_parser = parse_role)]
        role: Role,
    },
    /// Remove a node
    Remove { id: u64 },
    /// Transfer leadership (0 picks the most up-to-date voter)
    Transfer {
        #[arg(default_value_t = 0)]
        id: u64,
    },
    /// List the nodes in the cluster
    Cluster,
    /// Show the current leader
    Leader,
    /// Execute a write statement
    Exec { sql: String },
    /// Run a query and print the rows as tab-separated text
    Query { sql: String },
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{s}', expected voter, standby or spare"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let rc = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            if let Some(leader) = err.leader_hint() {
                eprintln!("Leader is node {} at {}", leader.id, leader.address);
            }
            1
        }
    };
    std::process::exit(rc);
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let client = Client::connect_leader(&cli.servers).await?;
    let result = dispatch(&client, &cli.db, cli.command).await;
    client.disconnect().await.ok();
    result
}

async fn dispatch(client: &Client, db: &str, command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Add { id, address } => client.add(id, &address).await,
        Commands::Assign { id, role } => client.assign(id, role).await,
        Commands::Remove { id } => client.remove(id).await,
        Commands::Transfer { id } => client.transfer(id).await,
        Commands::Cluster => {
            for node in client.cluster().await? {
                println!("{}\t{}\t{}", node.id, node.address, node.role.as_str());
            }
            Ok(())
        }
        Commands::Leader => {
            match client.leader().await? {
                Some(leader) => println!("{}\t{}", leader.id, leader.address),
                None => println!("no leader"),
            }
            Ok(())
        }
        Commands::Exec { sql } => {
            client.open(db).await?;
            let result = client.exec_sql(&sql, vec![]).await?;
            println!(
                "rows_affected={} last_insert_id={}",
                result.rows_affected, result.last_insert_id
            );
            Ok(())
        }
        Commands::Query { sql } => {
            client.open(db).await?;
            print_rows(&client.query_sql(&sql, vec![]).await?);
            Ok(())
        }
    }
}

fn print_rows(result: &QueryResult) {
    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(format_value).collect();
        println!("{}", cells.join("\t"));
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("x'{}'", hex::encode(b)),
    }
}
