use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gcw_core::telemetry::with_instance_fields;
use gcw_core::{
    BroadcastBus, ChatError, ChatInstance, ConnectionDescriptor, LoggedMessage, PageEvent,
    SessionKey, SubmitOutcome, TransportKind, TransportState, UiState, WidgetId, WidgetInput,
    WidgetPayload,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Instrument, field, info_span, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal host for a Greentic chat widget")]
struct Cli {
    /// Backend URL (ws, wss, http or https); defaults to CHAT_WIDGET_URL
    #[arg(long)]
    url: Option<String>,
    /// Force a transport: websocket, cors or jsonp
    #[arg(long)]
    transport: Option<TransportKind>,
    /// Resume an existing session
    #[arg(long)]
    session_key: Option<String>,
    /// Do not ask the backend for a greeting
    #[arg(long)]
    no_greeting: bool,
    /// Print page events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Say(String),
    Pick {
        widget: Option<String>,
        value: String,
    },
    Typing(bool),
    Open,
    Close,
    Toggle,
    Reconnect,
    Status,
    Quit,
    Help,
    Empty,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return if line.is_empty() {
            Command::Empty
        } else {
            Command::Say(line.to_string())
        };
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match name {
        "pick" => match args.split_once(' ') {
            Some((widget, value)) if widget.contains("-widget-") => Command::Pick {
                widget: Some(widget.to_string()),
                value: value.trim().to_string(),
            },
            _ => Command::Pick {
                widget: None,
                value: args.to_string(),
            },
        },
        "typing" => Command::Typing(!matches!(args, "off" | "false" | "0")),
        "open" => Command::Open,
        "close" => Command::Close,
        "toggle" => Command::Toggle,
        "reconnect" => Command::Reconnect,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    gcw_telemetry::install("gcw-console")?;
    let cli = Cli::parse();

    let mut descriptor = match &cli.url {
        Some(url) => ConnectionDescriptor::new(url),
        None => ConnectionDescriptor::from_env()?,
    };
    if let Some(transport) = cli.transport {
        descriptor.forced_transport = Some(transport);
    }
    if cli.no_greeting {
        descriptor.presentation.greet_on_connect = false;
    }
    descriptor.presentation.start_open = true;

    let bus = BroadcastBus::new();
    let mut page_events = bus.subscribe();
    let json = cli.json;
    tokio::spawn(async move {
        while let Ok(envelope) = page_events.recv().await {
            if json {
                match serde_json::to_string(&envelope.event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "page event not serializable"),
                }
                continue;
            }
            match envelope.event {
                PageEvent::Connectivity(event) if event.degraded => {
                    println!("! connection {} (degraded, /reconnect to retry)", event.state)
                }
                PageEvent::Connectivity(event) => println!("! connection {}", event.state),
                PageEvent::Interaction(event) => {
                    println!("! {} -> {}", event.widget_id, event.option_value)
                }
            }
        }
    });

    let mut instance = ChatInstance::new(descriptor, Arc::new(bus))?;
    if let Some(key) = cli.session_key.and_then(SessionKey::parse) {
        instance = instance.with_session_key(key);
    }

    let span = info_span!("console", instance_id = field::Empty, transport = field::Empty);
    with_instance_fields(&span, instance.instance_id(), Some(instance.transport_kind()));
    run(instance).instrument(span).await
}

async fn run(mut instance: ChatInstance) -> Result<()> {
    let mut printed = HashSet::new();
    if let Err(err) = instance.connect().await {
        println!("! could not connect: {err}");
    }
    print_new(&instance, &mut printed);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let live = instance.transport_state() != TransportState::Disconnected;
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Command::Quit => break,
                    command => {
                        if let Err(err) = execute(&mut instance, command).await {
                            println!("! {err}");
                        }
                    }
                }
            }
            event = instance.next_event(), if live => {
                if event.is_none() {
                    println!("! connection closed");
                }
            }
        }
        print_new(&instance, &mut printed);
    }

    instance.close().await;
    Ok(())
}

async fn execute(instance: &mut ChatInstance, command: Command) -> Result<(), ChatError> {
    match command {
        Command::Say(text) => instance.send_text(&text).await?,
        Command::Pick { widget, value } => {
            let Some(widget_id) = widget
                .map(WidgetId::new)
                .or_else(|| instance.latest_widget().cloned())
            else {
                println!("! no widget to answer");
                return Ok(());
            };
            let input = match instance.widget(&widget_id) {
                Some(engine) => WidgetInput::parse_for(engine.kind(), &value),
                None => return Err(ChatError::UnknownWidget(widget_id.to_string())),
            };
            match instance.submit_widget(&widget_id, input).await? {
                SubmitOutcome::Accepted(_) => {}
                SubmitOutcome::Rejected(reason) => println!("! rejected: {reason}"),
                SubmitOutcome::Ignored => println!("! {widget_id} was already answered"),
            }
        }
        Command::Typing(typing) => instance.set_typing(typing).await?,
        Command::Open => instance.open_ui(),
        Command::Close => instance.close_ui(),
        Command::Toggle => {
            let ui = instance.toggle_ui();
            println!("! chat {}", if ui == UiState::Open { "open" } else { "closed" });
        }
        Command::Reconnect => instance.reconnect().await?,
        Command::Status => {
            println!(
                "! {} via {} | session {} | unread {} | typing {}{}",
                instance.transport_state(),
                instance.transport_kind(),
                instance
                    .session_key()
                    .map(|key| key.to_string())
                    .unwrap_or_else(|| "-".into()),
                instance.unread(),
                instance.is_typing(),
                if instance.is_degraded() { " | degraded" } else { "" },
            );
        }
        Command::Help => {
            println!(
                "! commands: /pick [widget] <value>, /typing on|off, /open, /close, /toggle, /reconnect, /status, /quit"
            );
        }
        Command::Quit | Command::Empty => {}
    }
    Ok(())
}

fn print_new(instance: &ChatInstance, printed: &mut HashSet<String>) {
    // Nothing prints while the chat is closed; opening it catches up.
    if instance.ui_state() == UiState::Closed {
        return;
    }
    for entry in instance.log() {
        if printed.insert(entry.message.id.clone()) {
            print_entry(entry);
        }
    }
}

fn print_entry(entry: &LoggedMessage) {
    let who = if entry.message.is_from_bot() { "bot" } else { "you" };
    println!("[{who}] {}", entry.message.text);
    let (Some(widget_id), Some(widget)) = (&entry.widget_id, &entry.message.widget) else {
        return;
    };
    let hint = match widget {
        WidgetPayload::Buttons(choice)
        | WidgetPayload::QuickReplies(choice)
        | WidgetPayload::Select(choice) => choice
            .options
            .iter()
            .map(|option| format!("{} ({})", option.value, option.text))
            .collect::<Vec<_>>()
            .join(", "),
        WidgetPayload::Input(input) => input
            .placeholder
            .clone()
            .unwrap_or_else(|| "free text".into()),
        WidgetPayload::Slider(slider) => format!("{} to {}", slider.min, slider.max),
        WidgetPayload::Toggle(toggle) => format!("{} / {}", toggle.on_label, toggle.off_label),
        WidgetPayload::Rating(rating) => format!("1 to {}", rating.max),
    };
    println!("    {widget_id} [{}]: {hint}", widget.kind());
}
