use std::env;
use std::fs::metadata;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use futures::StreamExt;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use strum::EnumString;
use wharfe::btree::Direction;
use wharfe::btree::DocKey;
use wharfe::btree::Wharfe;
use wharfe::config::Config;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store location (".idx" and ".kv" extensions are added)
    store: String,

    /// Create a new store (will overwrite existing files)
    #[arg(short, long, default_value_t = false)]
    create: bool,

    #[command(subcommand)]
    parameter: Option<Parameter>,
}

#[derive(Debug, EnumString, Subcommand)]
#[strum(ascii_case_insensitive)]
enum Parameter {
    /// Does our store contain this key (under any docid)
    Contains { key: String },
    /// Display entry count
    Count,
    /// Delete this (key, docid) entry
    Delete { key: String, docid: String },
    /// List store entries
    Entries {
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Does our store contain exactly this (key, docid) entry
    Equals { key: String, docid: String },
    /// Display the lowest entry
    Front,
    /// Stream every value recorded under this key
    Get { key: String },
    /// Interactive Help
    Help,
    /// Insert a (key, docid, value) triple
    Insert {
        key: String,
        docid: String,
        value: String,
    },
    /// List store keys
    Keys {
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Verify store invariants
    Verify,
}

fn get_history_file() -> Option<PathBuf> {
    dirs::preference_dir()
        .and_then(|mut base| {
            base.push("wharfe");
            // Note: Not create_dir_all(), because we don't want to create preference
            // dirs if they don't exist.
            if metadata(base.clone()).ok().is_none() {
                std::fs::create_dir(base.clone()).ok()?
            }
            Some(base)
        })
        .map(|mut base| {
            base.push("history.txt");
            base
        })
}

async fn interactive(tree: Wharfe) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.load_history(&file_location) {
            println!("error loading history: {e}");
        }
    }
    println!("terminate with ctrl-c or ctrl-d");
    loop {
        let readline = rl.readline("wharfe: ");
        match readline {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                // EnumString doesn't deal with variant parameters, so...
                let words = line.split_whitespace().collect::<Vec<&str>>();
                let parameter = match Parameter::from_str(words[0]) {
                    Ok(p) => match p {
                        Parameter::Contains { key: _ } => {
                            if words.len() != 2 {
                                println!("usage: contains <key>");
                                continue;
                            }
                            Parameter::Contains {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::Delete { key: _, docid: _ } => {
                            if words.len() != 3 {
                                println!("usage: delete <key> <docid>");
                                continue;
                            }
                            Parameter::Delete {
                                key: words[1].to_string(),
                                docid: words[2].to_string(),
                            }
                        }
                        Parameter::Equals { key: _, docid: _ } => {
                            if words.len() != 3 {
                                println!("usage: equals <key> <docid>");
                                continue;
                            }
                            Parameter::Equals {
                                key: words[1].to_string(),
                                docid: words[2].to_string(),
                            }
                        }
                        Parameter::Get { key: _ } => {
                            if words.len() != 2 {
                                println!("usage: get <key>");
                                continue;
                            }
                            Parameter::Get {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::Insert {
                            key: _,
                            docid: _,
                            value: _,
                        } => {
                            if words.len() != 4 {
                                println!("usage: insert <key> <docid> <value>");
                                continue;
                            }
                            Parameter::Insert {
                                key: words[1].to_string(),
                                docid: words[2].to_string(),
                                value: words[3].to_string(),
                            }
                        }
                        Parameter::Keys { direction: _ } => match words.len() {
                            1 => Parameter::Keys { direction: None },
                            2 => {
                                let direction = Direction::from_str(words[1]).ok();
                                if direction.is_none() {
                                    println!("usage: keys [<direction>]");
                                    continue;
                                }
                                Parameter::Keys { direction }
                            }
                            _ => {
                                println!("usage: keys [<direction>]");
                                continue;
                            }
                        },
                        Parameter::Entries { direction: _ } => match words.len() {
                            1 => Parameter::Entries { direction: None },
                            2 => {
                                let direction = Direction::from_str(words[1]).ok();
                                if direction.is_none() {
                                    println!("usage: entries [<direction>]");
                                    continue;
                                }
                                Parameter::Entries { direction }
                            }
                            _ => {
                                println!("usage: entries [<direction>]");
                                continue;
                            }
                        },
                        _ => p,
                    },
                    Err(e) => {
                        println!("error: {e}");
                        continue;
                    }
                };
                process_parameter(&tree, &parameter).await;
                rl.add_history_entry(line.as_str())?;
            }
            Err(ReadlineError::Interrupted) => {
                println!("terminating...");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("terminating...");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.save_history(&file_location) {
            println!("error saving history: {e}");
        }
    }
    Ok(())
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

async fn process_parameter(tree: &Wharfe, parameter: &Parameter) {
    match parameter {
        Parameter::Contains { key } => match tree.contains(&DocKey::new(key.as_str(), "")).await {
            Ok(true) => println!("true"),
            Ok(false) => println!("false"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Count => match tree.count().await {
            Ok(count) => println!("count: {count}"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Delete { key, docid } => {
            match tree
                .remove(&DocKey::new(key.as_str(), docid.as_str()))
                .await
            {
                Ok(_) => println!("deleted: {key} {docid}"),
                Err(e) => println!("delete failed: {e}"),
            }
        }
        Parameter::Entries { direction } => {
            let direction = direction.unwrap_or(Direction::Ascending);
            let mut entries = Box::pin(tree.full_set(direction).await);
            let mut sep = "";
            while let Some((key, docid, value)) = entries.next().await {
                print!(
                    "{sep}{}:{}:{}",
                    printable(&key),
                    printable(&docid),
                    printable(&value)
                );
                sep = ", ";
            }
            println!();
        }
        Parameter::Equals { key, docid } => {
            match tree.equals(&DocKey::new(key.as_str(), docid.as_str())).await {
                Ok(true) => println!("true"),
                Ok(false) => println!("false"),
                Err(e) => println!("error: {e}"),
            }
        }
        Parameter::Front => match tree.front().await {
            Ok(Some((key, docid, value))) => println!(
                "{}:{}:{}",
                printable(&key),
                printable(&docid),
                printable(&value)
            ),
            Ok(None) => println!("empty"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Get { key } => {
            let mut values = Box::pin(tree.lookup(key.as_bytes()).await);
            let mut found = false;
            while let Some(value) = values.next().await {
                println!("{}", printable(&value));
                found = true;
            }
            if !found {
                println!("not found");
            }
        }
        Parameter::Help => {
            let help = Cli::command().render_help().to_string();

            let mut print_it = false;

            for line in help.lines() {
                if line.starts_with("Arguments:") {
                    print_it = false;
                }
                if print_it && !line.is_empty() {
                    println!("{}", line);
                }
                if line.starts_with("Commands:") {
                    print_it = true;
                }
            }
        }
        Parameter::Insert { key, docid, value } => {
            match tree
                .insert(DocKey::new(key.as_str(), docid.as_str()), value.as_str())
                .await
            {
                Ok(_) => println!("inserted: {key} {docid}: {value}"),
                Err(e) => println!("insert failed: {e}"),
            }
        }
        Parameter::Keys { direction } => {
            let direction = direction.unwrap_or(Direction::Ascending);
            let mut keys = Box::pin(tree.key_set(direction).await);
            let mut sep = "";
            while let Some(key) = keys.next().await {
                print!("{sep}{}", printable(&key));
                sep = ", ";
            }
            println!();
        }
        Parameter::Verify => match tree.verify().await {
            Ok(_) => println!("Ok"),
            Err(e) => println!("Verification failed: {e}"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "wharfe.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    let config = Config::new(format!("{}.idx", cli.store), format!("{}.kv", cli.store));

    let tree = if cli.create {
        Wharfe::try_new(config).await?
    } else {
        Wharfe::try_open(config).await?
    };

    match cli.parameter {
        Some(parameter) => {
            process_parameter(&tree, &parameter).await;
            tree.close().await?;
        }
        None => interactive(tree).await?,
    }
    Ok(())
}
