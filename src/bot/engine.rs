//! Routes inbound text to commands or the setup dialogue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use teloxide::utils::html::escape;
use tracing::{error, info};

use crate::bot::commands::{self, Command};
use crate::bot::conversation::{SessionTable, Step, Transition, UPSTREAM_DOWN, advance, start_prompt};
use crate::bot::database::{ReminderStore, StoreError};
use crate::bot::message::{Reply, format_reminder_details, format_reminder_line, format_stop_page};
use crate::bot::transit::{TransitData, TransitError, parse_service_no};

const STORE_DOWN: &str = "Sorry, I couldn't access your reminders right now. Please try again later.";
const SAVE_FAILED: &str =
    "Sorry, I couldn't save your reminder. Please send the time again to retry, or /cancel.";
const BUSLIST_USAGE: &str = "Usage: /buslist &lt;bus number&gt; [page]\nExample: /buslist 965 2";
const DELETE_USAGE: &str = "Usage: /deletereminder &lt;number&gt;\nExample: /deletereminder 1";
const IDLE_HINT: &str =
    "Use /setbusreminder to set up a bus reminder, or /help to see all commands.";

#[derive(Debug, Clone)]
pub struct BotSettings {
    /// Our own username, for `/command@username` addressing.
    pub bot_username: String,
    pub session_ttl: Duration,
    pub page_size: usize,
}

pub struct BusBot {
    store: Arc<ReminderStore>,
    transit: Arc<TransitData>,
    sessions: SessionTable,
    settings: BotSettings,
}

impl BusBot {
    pub fn new(store: Arc<ReminderStore>, transit: Arc<TransitData>, settings: BotSettings) -> Self {
        Self {
            store,
            transit,
            sessions: SessionTable::new(settings.session_ttl),
            settings,
        }
    }

    /// Handle one message or button press. `None` means stay silent.
    pub async fn handle_text(&self, chat_id: i64, first_name: Option<&str>, text: &str) -> Option<Reply> {
        let now = Instant::now();
        match commands::parse(text, &self.settings.bot_username) {
            Some(command) => Some(self.handle_command(chat_id, first_name, command, now).await),
            // Addressed to another bot
            None if text.trim_start().starts_with('/') => None,
            None => Some(self.handle_reply(chat_id, text, now).await),
        }
    }

    /// Drop abandoned setups.
    pub async fn sweep_sessions(&self) -> usize {
        self.sessions.sweep(Instant::now()).await
    }

    async fn handle_command(
        &self,
        chat_id: i64,
        first_name: Option<&str>,
        command: Command,
        now: Instant,
    ) -> Reply {
        info!("Command from {}: {:?}", chat_id, command);
        match command {
            Command::Start => Reply::text(format!(
                "Hello {}! Welcome to the bus reminder bot.\nUse /help to see available commands.",
                escape(first_name.unwrap_or("there"))
            )),
            Command::Help => Reply::text(commands::help_text()),
            Command::SetBusReminder => {
                self.sessions.start(chat_id, now).await;
                start_prompt()
            }
            Command::Cancel => {
                if self.sessions.cancel(chat_id, now).await {
                    Reply::text("Reminder setup cancelled.")
                } else {
                    Reply::text("No reminder setup in progress.")
                }
            }
            Command::List => self.list(chat_id),
            Command::DeleteReminder(args) => self.delete(chat_id, &args),
            Command::BusList(args) => self.bus_list(chat_id, &args, now).await,
            Command::Unknown(name) => Reply::text(format!(
                "Unknown command /{}. Use /help to see available commands.",
                escape(&name)
            )),
        }
    }

    async fn handle_reply(&self, chat_id: i64, text: &str, now: Instant) -> Reply {
        let Some(step) = self.sessions.take(chat_id, now).await else {
            return Reply::text(IDLE_HINT);
        };

        match advance(&step, chat_id, text, &self.transit).await {
            Transition::Continue { step, reply } => {
                self.sessions.put(chat_id, step, now).await;
                reply
            }
            Transition::Complete(new) => match self.store.create(&new) {
                Ok(reminder) => {
                    Reply::text(format!("Reminder saved!\n\n{}", format_reminder_details(&reminder)))
                }
                Err(e) => {
                    error!("Failed to save reminder for {}: {}", chat_id, e);
                    self.sessions.put(chat_id, step, now).await;
                    Reply::text(SAVE_FAILED)
                }
            },
        }
    }

    fn list(&self, chat_id: i64) -> Reply {
        let reminders = match self.store.list(chat_id) {
            Ok(reminders) => reminders,
            Err(e) => {
                error!("Failed to list reminders for {}: {}", chat_id, e);
                return Reply::text(STORE_DOWN);
            }
        };
        if reminders.is_empty() {
            return Reply::text(
                "You don't have any bus reminders set yet!\nUse /setbusreminder to create one.",
            );
        }

        let mut text = String::from("<b>Your Bus Reminders:</b>\n\n");
        for reminder in &reminders {
            text.push_str(&format_reminder_line(reminder));
            text.push('\n');
        }
        Reply::text(text)
    }

    fn delete(&self, chat_id: i64, args: &str) -> Reply {
        if args.is_empty() {
            return Reply::text(DELETE_USAGE);
        }
        let seq = match args.parse::<i64>() {
            Ok(seq) if seq > 0 => seq,
            _ => {
                return Reply::text(
                    "Please provide a valid reminder number. Example: /deletereminder 1",
                );
            }
        };

        match self.store.delete(chat_id, seq) {
            Ok(reminder) => {
                info!("Deleted reminder #{} for {}", seq, chat_id);
                Reply::text(format!(
                    "Deleted reminder #{}:\n{}",
                    seq,
                    format_reminder_details(&reminder)
                ))
            }
            Err(StoreError::NotFound { .. }) => match self.store.list(chat_id) {
                Ok(remaining) if remaining.is_empty() => {
                    Reply::text("You have no reminders to delete.")
                }
                Ok(_) => Reply::text(format!(
                    "Reminder #{seq} not found. Use /list to see your reminders."
                )),
                Err(e) => {
                    error!("Failed to list reminders for {}: {}", chat_id, e);
                    Reply::text(STORE_DOWN)
                }
            },
            Err(e) => {
                error!("Failed to delete reminder #{} for {}: {}", seq, chat_id, e);
                Reply::text(STORE_DOWN)
            }
        }
    }

    /// `/buslist [page]` lists the stops of the service being set up;
    /// `/buslist <service> [page]` works at any time. During setup a lone
    /// number past the last page is read as a service.
    async fn bus_list(&self, chat_id: i64, args: &str, now: Instant) -> Reply {
        let in_setup = match self.sessions.peek(chat_id, now).await {
            Some(Step::AwaitStop { service_no }) => Some(service_no),
            _ => None,
        };
        let tokens: Vec<&str> = args.split_whitespace().collect();

        let setup_page = match (&in_setup, tokens.as_slice()) {
            (Some(_), []) => Some(1),
            (Some(service_no), [arg]) => match arg.parse::<usize>() {
                Ok(page) if self.has_stop_page(service_no, page).await => Some(page),
                _ => None,
            },
            _ => None,
        };

        let (service_no, page, more_command) = match (in_setup, setup_page) {
            (Some(service_no), Some(page)) => (service_no, page, "/buslist".to_string()),
            _ => match tokens.as_slice() {
                [service] | [service, _] => {
                    let Ok(service_no) = parse_service_no(service) else {
                        return Reply::text(BUSLIST_USAGE);
                    };
                    let page = match tokens.get(1) {
                        Some(page) => match page.parse::<usize>() {
                            Ok(page) => page,
                            Err(_) => return Reply::text(BUSLIST_USAGE),
                        },
                        None => 1,
                    };
                    let more_command = format!("/buslist {service_no}");
                    (service_no, page, more_command)
                }
                _ => return Reply::text(BUSLIST_USAGE),
            },
        };

        match self.transit.list_route_stops(&service_no).await {
            Ok(stops) => Reply::text(format_stop_page(
                &service_no,
                &stops,
                page,
                self.settings.page_size,
                &more_command,
            )),
            Err(TransitError::NotFound) => {
                Reply::text(format!("Bus {} does not exist!", escape(&service_no)))
            }
            Err(TransitError::UpstreamUnavailable(e)) => {
                error!("Stop listing for bus {} failed: {}", service_no, e);
                Reply::text(UPSTREAM_DOWN)
            }
        }
    }
    /// Lookup failures count as a page so the listing reports them.
    async fn has_stop_page(&self, service_no: &str, page: usize) -> bool {
        match self.transit.list_route_stops(service_no).await {
            Ok(stops) => {
                let pages = stops.len().div_ceil(self.settings.page_size.max(1)).max(1);
                (1..=pages).contains(&page)
            }
            Err(_) => true,
        }
    }
}
