//! Chat command handler.
//!
//! Line-oriented front end over the session lifecycle and chat engine.
//! Assistant text goes to stdout; progress and diagnostics go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::config::{self, paths};
use relay_core::core::bootstrap::FileMigrationLedger;
use relay_core::core::bus::Subscription;
use relay_core::core::chat::{ChatEngine, ChatOptions};
use relay_core::core::events::{ChatEvent, InterruptOutcome};
use relay_core::core::interrupt::{self, InterruptedError};
use relay_core::core::lifecycle::{InitContext, LifecycleDeps, SessionLifecycle};
use relay_core::core::recipe_gate::{
    self, FileAcceptanceStore, GatePhase, RecipeGate, RecipeGateFlow, RecipeOrigin,
};
use relay_core::core::session::{ParameterValues, Session};
use relay_core::gateway::ToolConfirmationAction;
use relay_core::gateway::http::HttpGateway;
use relay_core::recipe::Recipe;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type Input = Lines<BufReader<Stdin>>;

pub struct ChatRunOptions {
    pub recipe: Option<PathBuf>,
    pub params: Vec<String>,
    pub resume: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub auto_accept: bool,
}

const HELP: &str = "Commands: :q quit, :edit N TEXT replace your Nth message, \
:history QUERY search input history, :tokens show token counts";

pub async fn run(opts: ChatRunOptions, config: &config::Config) -> Result<()> {
    let gateway = Arc::new(HttpGateway::from_config(config)?);
    tracing::info!(server = %gateway.base_url(), "Starting chat");

    let recipe = opts
        .recipe
        .as_deref()
        .map(Recipe::from_file)
        .transpose()?;
    let given = recipe_gate::parse_parameter_pairs(opts.params.iter().map(String::as_str))?;

    let working_dir = match opts.working_dir {
        Some(dir) => dir,
        None => config.effective_working_dir()?,
    };

    let lifecycle = SessionLifecycle::new(LifecycleDeps {
        config: Arc::clone(&gateway) as _,
        extensions: Arc::clone(&gateway) as _,
        transport: Arc::clone(&gateway) as _,
        ledger: Arc::new(FileMigrationLedger::new(paths::state_path())),
        cost: Some(Arc::clone(&gateway) as _),
        working_dir: working_dir.clone(),
    });

    let mut ctx = match opts.resume {
        Some(id) => InitContext::resume(id),
        None => InitContext::new_chat(),
    };
    ctx.recipe = recipe;
    let ctx = ctx
        .working_dir(working_dir)
        .on_progress(|message| eprintln!("{message}..."));

    let session = lifecycle.initialize(ctx).await?;
    eprintln!("Agent is ready (session {})", session.id);

    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();
    let engine = ChatEngine::new(
        session.clone(),
        Arc::clone(&gateway) as _,
        ChatOptions::from_config(config),
    );
    let mut events = engine.subscribe();

    let phase = match &session.recipe {
        Some(recipe) => {
            let gate = RecipeGate::new(
                Arc::clone(&gateway) as _,
                Arc::new(FileAcceptanceStore::new(paths::recipe_hashes_dir())),
            );
            let mut values = session.parameters.clone().unwrap_or_default();
            values.extend(given);
            let phase = run_gate(
                &gate,
                recipe,
                RecipeOrigin::of(&session),
                &session,
                &mut values,
                &mut input,
                opts.auto_accept,
            )
            .await?;
            engine.set_parameters(recipe_gate::resolve_parameters(
                recipe.declared_parameters(),
                &values,
            ));
            phase
        }
        None => GatePhase::Ready,
    };

    print_transcript(&session);
    if engine.run_recipe_prompt(&phase)? {
        render_reply(&engine, &mut events, &mut input).await?;
    }

    eprintln!("{HELP}");
    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();

        let line = tokio::select! {
            biased;
            () = interrupt::wait() => return Err(InterruptedError.into()),
            line = input.next_line() => line.context("read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Command::Quit => break,
            Command::Edit { nth, text } => {
                let Some(index) = nth_user_message(&engine, nth) else {
                    eprintln!("No user message #{nth}");
                    continue;
                };
                engine.edit(index, &text)?;
                render_reply(&engine, &mut events, &mut input).await?;
            }
            Command::History { query } => {
                for entry in engine.search_input_history(&query) {
                    eprintln!("  {entry}");
                }
            }
            Command::Tokens => {
                if let Err(err) = engine.refresh_token_usage().await {
                    eprintln!("Could not fetch server token counts: {err}");
                }
                let local = engine.token_estimates();
                let usage = engine.usage();
                eprintln!(
                    "Estimated tokens: {} in, {} out. Server total: {}",
                    local.input,
                    local.output,
                    usage
                        .total
                        .map_or_else(|| "unknown".to_string(), |t| t.to_string())
                );
            }
            Command::Say(text) => {
                engine.submit(&text)?;
                render_reply(&engine, &mut events, &mut input).await?;
            }
        }
    }

    tracing::info!(session_id = %engine.session_id(), "Chat ended");
    Ok(())
}

/// Walks the gate phases until the conversation may start.
async fn run_gate(
    gate: &RecipeGate,
    recipe: &Recipe,
    origin: RecipeOrigin,
    session: &Session,
    values: &mut ParameterValues,
    input: &mut Input,
    auto_accept: bool,
) -> Result<GatePhase> {
    let evaluation = gate.evaluate(recipe, origin).await?;
    let mut flow = RecipeGateFlow::new(evaluation);
    let has_messages = !session.messages.is_empty();

    loop {
        match flow.next_phase(values, has_messages) {
            GatePhase::AwaitingAcceptance => {
                eprintln!("Recipe: {}", recipe.title);
                eprintln!("{}", recipe.description);
                for warning in flow.evaluation().warnings() {
                    eprintln!("Warning: {}", warning.message);
                }
                let accepted = auto_accept || ask_yes_no("Run this recipe? [y/N] ", input).await?;
                if !accepted {
                    anyhow::bail!("Recipe '{}' was not accepted", recipe.title);
                }
                gate.accept(recipe)?;
                flow.mark_accepted();
            }
            GatePhase::AwaitingParameters(missing) => {
                for key in missing {
                    let description = recipe
                        .declared_parameters()
                        .iter()
                        .find(|p| p.key == key)
                        .map(|p| p.description.as_str())
                        .filter(|d| !d.is_empty())
                        .unwrap_or(key.as_str())
                        .to_string();
                    let value = ask(&format!("{description}: "), input).await?;
                    values.insert(key, value);
                }
            }
            GatePhase::Ready => return Ok(GatePhase::Ready),
        }
    }
}

async fn ask(prompt: &str, input: &mut Input) -> Result<String> {
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    let line = input.next_line().await.context("read stdin")?;
    Ok(line.unwrap_or_default().trim().to_string())
}

async fn ask_yes_no(prompt: &str, input: &mut Input) -> Result<bool> {
    let answer = ask(prompt, input).await?;
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

/// Prints reply events until the stream ends. Ctrl+C stops the reply.
async fn render_reply(
    engine: &ChatEngine,
    events: &mut Subscription<ChatEvent>,
    input: &mut Input,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            biased;
            () = interrupt::wait() => {
                engine.stop();
                interrupt::acknowledge();
                continue;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Ok(());
        };

        match &*event {
            ChatEvent::StreamStarted { .. } | ChatEvent::InputRestored { .. } => {}
            ChatEvent::AssistantDelta { text } => {
                print!("{text}");
                let _ = stdout.flush();
            }
            ChatEvent::ToolRequested { name, .. } => {
                eprintln!("\n[tool] {name}");
            }
            ChatEvent::ToolConfirmationRequested { id, tool_name, prompt } => {
                if let Some(prompt) = prompt {
                    eprintln!("\n{prompt}");
                }
                let allow = ask_yes_no(&format!("Allow {tool_name}? [y/N] "), input).await?;
                let action = if allow {
                    ToolConfirmationAction::AllowOnce
                } else {
                    ToolConfirmationAction::Deny
                };
                if let Err(err) = engine.confirm_tool(id, action).await {
                    eprintln!("Could not send tool decision: {err}");
                }
            }
            ChatEvent::Notification { request_id, .. } => {
                tracing::debug!(%request_id, "Tool notification");
            }
            ChatEvent::ModelChanged { model, mode } => {
                eprintln!("\n[model] {model} ({mode})");
            }
            ChatEvent::Error { message } => {
                eprintln!("\nError: {message}");
                return Ok(());
            }
            ChatEvent::Finished { .. } => {
                println!();
                return Ok(());
            }
            ChatEvent::Interrupted { outcome } => {
                match outcome {
                    InterruptOutcome::RolledBack { text } => {
                        eprintln!("\nInterrupted. Your message was withdrawn: {text}");
                    }
                    InterruptOutcome::ToolCallsCancelled { ids } => {
                        eprintln!("\nInterrupted. Cancelled {} tool call(s).", ids.len());
                    }
                    InterruptOutcome::NothingPending => eprintln!("\nInterrupted."),
                }
                return Ok(());
            }
            ChatEvent::CreateRecipeRequested => {}
        }
    }
}

fn print_transcript(session: &Session) {
    for message in &session.messages {
        if !message.metadata.user_visible {
            continue;
        }
        let text = message.text();
        if text.is_empty() {
            continue;
        }
        let who = if message.is_plain_user_message() { ">" } else { " " };
        eprintln!("{who} {text}");
    }
}

/// Transcript index of the `nth` (1-based) plain user message.
fn nth_user_message(engine: &ChatEngine, nth: usize) -> Option<usize> {
    engine
        .messages()
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_plain_user_message())
        .nth(nth.checked_sub(1)?)
        .map(|(index, _)| index)
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Quit,
    Edit { nth: usize, text: String },
    History { query: String },
    Tokens,
    Say(String),
}

fn parse_command(line: &str) -> Command {
    let mut parts = line.splitn(2, ' ');
    let head = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();
    match head {
        ":q" | ":quit" => Command::Quit,
        ":tokens" => Command::Tokens,
        ":history" => Command::History {
            query: rest.to_string(),
        },
        ":edit" => {
            let mut args = rest.splitn(2, ' ');
            let nth = args.next().and_then(|n| n.parse().ok());
            let text = args.next().map(str::trim).unwrap_or_default();
            match nth {
                Some(nth) if !text.is_empty() => Command::Edit {
                    nth,
                    text: text.to_string(),
                },
                _ => Command::Say(line.to_string()),
            }
        }
        _ => Command::Say(line.to_string()),
    }
}
