//! Interactive REPL mode

use console::style;
use gateway::{AuditLogEntry, Gateway};
use serde_json::Value;
use std::io::{self, Write};

/// Interactive CLI over an in-process gateway
pub struct InteractiveCli {
    gateway: Gateway,
    credential: Option<String>,
}

impl InteractiveCli {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            credential: None,
        }
    }

    /// Run the interactive REPL
    pub async fn run(&mut self) -> anyhow::Result<()> {
        println!("Toolgate Interactive Mode");
        println!("Type /help for commands, /quit to exit");
        println!();

        loop {
            let who = if self.credential.is_some() { "logged in" } else { "no credential" };
            print!("[{}] > ", who);
            io::stdout().flush()?;

            let mut input = String::new();
            if io::stdin().read_line(&mut input)? == 0 {
                break;
            }
            let input = input.trim();

            if input.is_empty() {
                continue;
            }

            match self.handle_command(input).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => println!("{} {}", style("Error:").red(), e),
            }
        }

        Ok(())
    }

    /// Handle one line; returns `true` when the session should end
    pub async fn handle_command(&mut self, input: &str) -> anyhow::Result<bool> {
        let input = input.trim();
        let (cmd, rest) = match input.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (input, ""),
        };

        match cmd {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                return Ok(true);
            }
            "/help" | "/h" => {
                println!("Commands:");
                println!("  /login <key>          - Use a credential for later calls");
                println!("  /logout               - Forget the credential");
                println!("  /tools [query]        - List or search tools");
                println!("  /call <tool> [json]   - Execute a tool");
                println!("  /audit [n]            - Show the last n audit entries");
                println!("  /failures [n]         - Show the last n failed audit entries");
                println!("  /health               - Show gateway health");
                println!("  /metrics              - Show gateway metrics");
                println!("  /quit                 - Exit");
            }
            "/login" => {
                if rest.is_empty() {
                    anyhow::bail!("usage: /login <key>");
                }
                self.credential = Some(rest.to_string());
                println!("Credential set");
            }
            "/logout" => {
                self.credential = None;
                println!("Credential cleared");
            }
            "/tools" => {
                let tools = if rest.is_empty() {
                    self.gateway.registry().list()
                } else {
                    self.gateway.registry().search(rest)
                };
                if tools.is_empty() {
                    println!("  (no tools)");
                }
                for tool in tools {
                    println!(
                        "  {:<12} {} [{}]",
                        style(&tool.definition.name).cyan(),
                        tool.definition.description,
                        tool.status
                    );
                }
            }
            "/call" => {
                let body = self.call(rest).await?;
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            "/audit" | "/failures" => {
                let limit = if rest.is_empty() { 10 } else { rest.parse()? };
                let entries = if cmd == "/failures" {
                    self.gateway.audit().get_recent_failures(limit)
                } else {
                    self.gateway.audit().get_recent(limit)
                };
                if entries.is_empty() {
                    println!("  (no entries)");
                }
                for entry in entries {
                    print_entry(entry);
                }
            }
            "/health" => {
                println!("{}", serde_json::to_string_pretty(&self.gateway.health())?);
            }
            "/metrics" => {
                println!("{}", serde_json::to_string_pretty(&self.gateway.metrics())?);
            }
            _ => {
                println!("Unknown command: {}", cmd);
            }
        }

        Ok(false)
    }

    async fn call(&self, args: &str) -> anyhow::Result<Value> {
        let credential = self
            .credential
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no credential; use /login <key> first"))?;

        let (tool, params) = match args.split_once(char::is_whitespace) {
            Some((tool, json)) => (tool, serde_json::from_str(json.trim())?),
            None if !args.is_empty() => (args, Value::Null),
            None => anyhow::bail!("usage: /call <tool> [json]"),
        };

        Ok(self.gateway.execute(tool, params, credential).await.to_json())
    }
}

fn print_entry(entry: AuditLogEntry) {
    let mark = if entry.success { style("ok").green() } else { style("FAIL").red() };
    println!(
        "  {} {:<4} {:<17} {:<10} {} {}",
        entry.timestamp.format("%H:%M:%S"),
        mark,
        entry.action.as_str(),
        entry.user_id,
        entry.resource,
        entry.error.unwrap_or_default()
    );
}
