use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings,
    presentation::{channel_display_name, format_message_time_now},
    Messenger, MessengerEvent,
};
use shared::domain::{ChannelId, UserId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `backend_url` from client.toml and the environment.
    #[arg(long)]
    backend_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Status,
    Channels {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        search: Option<String>,
    },
    Messages {
        channel_id: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    Send {
        content: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    CreateChannel {
        user_id: String,
    },
    /// Prints pushed messages until interrupted.
    Tail {
        #[arg(long)]
        channel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(backend_url) = cli.backend_url {
        settings.backend_url = backend_url;
    }
    let messenger = Messenger::connect(settings)?;

    match cli.command {
        Command::Status => {
            println!("server status: {:?}", messenger.server_status().await);
        }
        Command::Channels { limit, search } => {
            if !messenger.fetch_channels(limit).await {
                bail!(messenger.channels_error().await.unwrap_or_default());
            }
            let channels = match search {
                Some(query) => messenger.search_channels(&query).await,
                None => messenger.channels().await,
            };
            for channel in channels {
                let last_activity = format_message_time_now(channel.last_activity());
                let preview = channel
                    .latest_message
                    .as_ref()
                    .map(|latest| latest.content.as_str())
                    .unwrap_or("");
                println!(
                    "{}  {:<24} {:>10}  {}",
                    channel.channel_id,
                    channel_display_name(&channel),
                    last_activity,
                    preview
                );
            }
        }
        Command::Messages { channel_id, limit } => {
            let channel_id = ChannelId::new(channel_id);
            if !messenger.fetch_messages(&channel_id, limit).await {
                bail!(messenger.messages_error(&channel_id).await.unwrap_or_default());
            }
            for message in messenger.messages(&channel_id).await {
                println!(
                    "[{}] {}: {}",
                    format_message_time_now(message.created_at),
                    messenger.sender_name(&message).await,
                    message.content
                );
            }
        }
        Command::Send {
            content,
            channel,
            to,
        } => {
            let channel = channel.map(ChannelId::new);
            let to = to.map(UserId::new);
            let message = messenger
                .send_message(&content, channel.as_ref(), to.as_ref())
                .await?;
            println!(
                "sent message_id={} channel_id={}",
                message.message_id, message.channel_id
            );
        }
        Command::CreateChannel { user_id } => {
            let channel = messenger.create_channel(&UserId::new(user_id)).await?;
            println!(
                "channel_id={} ({})",
                channel.channel_id,
                channel_display_name(&channel)
            );
        }
        Command::Tail { channel } => {
            let mut events = BroadcastStream::new(messenger.subscribe_events());
            match channel {
                Some(channel_id) => {
                    messenger
                        .subscribe_channel(&ChannelId::new(channel_id))
                        .await
                }
                None => messenger.subscribe_all().await,
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => match event {
                        Some(Ok(MessengerEvent::MessagesUpdated { channel_id })) => {
                            if let Some(message) = messenger.messages(&channel_id).await.last() {
                                println!(
                                    "[{}] #{} {}: {}",
                                    format_message_time_now(message.created_at),
                                    channel_id,
                                    messenger.sender_name(message).await,
                                    message.content
                                );
                            }
                        }
                        Some(Ok(MessengerEvent::SubscriptionStatusChanged { key, status })) => {
                            println!("subscription {key}: {status:?}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => warn!("tail: {err}"),
                        None => break,
                    },
                }
            }
            messenger.unsubscribe_all().await;
        }
    }

    Ok(())
}
