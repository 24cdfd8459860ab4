//! Line-oriented operator console on stdin.

use std::path::PathBuf;

use sluice_proxy::{ProxyServer, RequestEdit};
use sluice_store::{ChunkKind, Transaction};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  intercept [on|off]        show or toggle interception
  pending                   list queued requests and responses
  forward <id>              send a queued request upstream
  review <id>               send it upstream and hold the response
  drop <id>                 answer the client with 444 and record the drop
  retarget <id> <url>       rewrite the request URL, then forward it
  respond <id> <file>       replace a held response with a raw dump from disk
  history                   list recorded transactions
  show <id>                 print a recorded transaction
  help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Intercept(Option<bool>),
    Pending,
    Forward { id: String, review: bool },
    Drop(String),
    Retarget { id: String, url: String },
    Respond { id: String, path: PathBuf },
    History,
    Show(String),
    Help,
}

impl Command {
    pub(crate) fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let command = match name {
            "intercept" => match words.next() {
                None => Self::Intercept(None),
                Some("on") => Self::Intercept(Some(true)),
                Some("off") => Self::Intercept(Some(false)),
                Some(other) => return Err(format!("intercept: expected on or off, got {other}")),
            },
            "pending" => Self::Pending,
            "forward" => Self::Forward {
                id: required(&mut words, name, "id")?,
                review: false,
            },
            "review" => Self::Forward {
                id: required(&mut words, name, "id")?,
                review: true,
            },
            "drop" => Self::Drop(required(&mut words, name, "id")?),
            "retarget" => Self::Retarget {
                id: required(&mut words, name, "id")?,
                url: required(&mut words, name, "url")?,
            },
            "respond" => Self::Respond {
                id: required(&mut words, name, "id")?,
                path: PathBuf::from(required(&mut words, name, "file")?),
            },
            "history" => Self::History,
            "show" => Self::Show(required(&mut words, name, "id")?),
            "help" | "?" => Self::Help,
            other => return Err(format!("unknown command {other}, try help")),
        };
        Ok(Some(command))
    }
}

fn required<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &str,
    what: &str,
) -> Result<String, String> {
    words
        .next()
        .map(str::to_string)
        .ok_or_else(|| format!("{command}: missing {what}"))
}

pub(crate) async fn run(proxy: ProxyServer) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "console input closed");
                return;
            }
        };
        match Command::parse(&line) {
            Ok(Some(command)) => {
                if let Err(message) = execute(&proxy, command).await {
                    tracing::warn!("{message}");
                }
            }
            Ok(None) => {}
            Err(message) => tracing::warn!("{message}"),
        }
    }
}

async fn execute(proxy: &ProxyServer, command: Command) -> Result<(), String> {
    match command {
        Command::Intercept(None) => {
            println!(
                "interception {}",
                if proxy.intercept_enabled() { "on" } else { "off" }
            );
        }
        Command::Intercept(Some(enabled)) => {
            let released = proxy.set_intercept_enabled(enabled);
            if released > 0 {
                println!("released {released} queued transactions");
            }
        }
        Command::Pending => {
            for transaction in proxy.pending_requests() {
                println!("request  {}", line_for(&transaction));
            }
            for transaction in proxy.pending_responses() {
                println!("response {}", line_for(&transaction));
            }
        }
        Command::Forward { id, review } => {
            proxy
                .forward_request(&id, review)
                .map_err(|err| err.to_string())?;
        }
        Command::Drop(id) => proxy.drop_request(&id).map_err(|err| err.to_string())?,
        Command::Retarget { id, url } => {
            let edit = RequestEdit {
                url: Some(url),
                ..RequestEdit::default()
            };
            proxy
                .modify_request(&id, edit)
                .map_err(|err| err.to_string())?;
        }
        Command::Respond { id, path } => {
            let dump = tokio::fs::read(&path)
                .await
                .map_err(|err| format!("{}: {err}", path.display()))?;
            proxy
                .modify_response(&id, dump)
                .map_err(|err| err.to_string())?;
        }
        Command::History => {
            for summary in proxy.store().summaries() {
                let status = summary
                    .status_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5} {} {} {} {}",
                    summary.seq_number, summary.id, status, summary.method, summary.url
                );
            }
        }
        Command::Show(id) => show(proxy, &id)?,
        Command::Help => println!("{HELP}"),
    }
    Ok(())
}

fn show(proxy: &ProxyServer, id: &str) -> Result<(), String> {
    let metadata = proxy
        .transaction_metadata(id)
        .map_err(|err| err.to_string())?;
    let mut request = Vec::with_capacity(metadata.request_size);
    for index in 0..metadata.request_chunks {
        let chunk = proxy
            .transaction_chunk(id, ChunkKind::Request, index)
            .map_err(|err| err.to_string())?;
        request.extend_from_slice(&chunk.data);
    }
    println!("{}", String::from_utf8_lossy(&request));

    if metadata.has_response {
        let transaction = proxy
            .store()
            .get(id)
            .ok_or_else(|| format!("transaction {id} vanished"))?;
        if let Some(response) = transaction.response {
            println!("{}", response.printable());
        }
    }
    Ok(())
}

fn line_for(transaction: &Transaction) -> String {
    let summary = transaction.summary();
    format!("{} {} {}", summary.id, summary.method, summary.url)
}
