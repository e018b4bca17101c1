//! Reminder setup dialogue.
//!
//! A session walks service -> stop -> days -> time. Every reply either
//! advances one step or re-prompts with the step unchanged; nothing is
//! written to the store until the time step completes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use teloxide::utils::html::escape;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bot::message::{Reply, stop_label};
use crate::bot::reminders::{DaysMode, NewReminder, parse_trigger_time};
use crate::bot::transit::{BusStop, StopMatch, TransitData, TransitError, parse_service_no};

/// Candidates listed when a stop name is ambiguous.
const MAX_CANDIDATES: usize = 5;

pub const UPSTREAM_DOWN: &str =
    "Sorry, I couldn't reach the bus data service. Please try again in a moment.";

/// Where a session is in the dialogue.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    AwaitService,
    AwaitStop {
        service_no: String,
    },
    AwaitDays {
        service_no: String,
        stop: BusStop,
    },
    AwaitTime {
        service_no: String,
        stop: BusStop,
        days: DaysMode,
    },
}

/// Outcome of feeding one reply to a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Stay in (or move to) `step` after sending `reply`.
    Continue { step: Step, reply: Reply },
    /// All fields collected; the caller persists and tears the session down.
    Complete(NewReminder),
}

impl Transition {
    fn stay(step: &Step, reply: Reply) -> Self {
        Transition::Continue {
            step: step.clone(),
            reply,
        }
    }
}

/// First prompt of a new session.
pub fn start_prompt() -> Reply {
    Reply::text("Which bus number? (e.g. 970)")
}

fn days_prompt(text: String) -> Reply {
    Reply::text(text)
        .with_button(DaysMode::Weekdays.label(), DaysMode::Weekdays.as_str())
        .with_button(DaysMode::Daily.label(), DaysMode::Daily.as_str())
}

fn time_prompt() -> Reply {
    Reply::text("What time? (HH:MM, 24-hour)")
}

/// Feed one user reply to the current step.
pub async fn advance(step: &Step, owner_id: i64, input: &str, transit: &TransitData) -> Transition {
    let input = input.trim();
    match step {
        Step::AwaitService => on_service(step, input, transit).await,
        Step::AwaitStop { service_no } => on_stop(step, service_no, input, transit).await,
        Step::AwaitDays { service_no, stop } => on_days(step, service_no, stop, input),
        Step::AwaitTime {
            service_no,
            stop,
            days,
        } => on_time(step, owner_id, service_no, stop, *days, input),
    }
}

async fn on_service(step: &Step, input: &str, transit: &TransitData) -> Transition {
    let not_found = || {
        Reply::text(format!(
            "Bus {} does not exist!\nPlease try again with a valid bus number.",
            escape(input)
        ))
    };

    let Ok(service_no) = parse_service_no(input) else {
        return Transition::stay(step, not_found());
    };

    match transit.list_route_stops(&service_no).await {
        Ok(route) => {
            debug!("Bus {} accepted ({} stops)", service_no, route.len());
            Transition::Continue {
                reply: Reply::text(format!(
                    "Bus <b>{}</b> it is.\nPlease enter the 5 digit bus stop code or the stop name (e.g. Jurong East Int).\nSend /buslist to see the stops on this route.",
                    escape(&service_no)
                )),
                step: Step::AwaitStop { service_no },
            }
        }
        Err(TransitError::NotFound) => Transition::stay(step, not_found()),
        Err(TransitError::UpstreamUnavailable(e)) => {
            warn!("Route lookup for bus {} failed: {}", service_no, e);
            Transition::stay(step, Reply::text(UPSTREAM_DOWN))
        }
    }
}

async fn on_stop(step: &Step, service_no: &str, input: &str, transit: &TransitData) -> Transition {
    match transit.find_stop(service_no, input).await {
        Ok(StopMatch::Found(stop)) => Transition::Continue {
            reply: days_prompt(format!(
                "Bus stop confirmed: {}\n\nWhen should I send reminders?",
                stop_label(&stop.display_name(), &stop.code)
            )),
            step: Step::AwaitDays {
                service_no: service_no.to_string(),
                stop,
            },
        },
        Ok(StopMatch::Ambiguous(candidates)) => {
            let mut text = format!("I found multiple stops matching \"{}\":\n", escape(input));
            for stop in candidates.iter().take(MAX_CANDIDATES) {
                text.push_str(&format!("• {}\n", stop_label(&stop.display_name(), &stop.code)));
            }
            if candidates.len() > MAX_CANDIDATES {
                text.push_str(&format!("…and {} more\n", candidates.len() - MAX_CANDIDATES));
            }
            text.push_str("Try entering the exact 5-digit bus stop code.");
            Transition::stay(step, Reply::text(text))
        }
        Err(TransitError::NotFound) => Transition::stay(
            step,
            Reply::text(format!(
                "Invalid bus stop or stop not found on Bus {}.\nPlease enter a valid 5-digit bus stop code or stop name.",
                escape(service_no)
            )),
        ),
        Err(TransitError::UpstreamUnavailable(e)) => {
            warn!("Stop lookup on bus {} failed: {}", service_no, e);
            Transition::stay(step, Reply::text(UPSTREAM_DOWN))
        }
    }
}

fn on_days(step: &Step, service_no: &str, stop: &BusStop, input: &str) -> Transition {
    match input.parse::<DaysMode>() {
        Ok(days) => Transition::Continue {
            step: Step::AwaitTime {
                service_no: service_no.to_string(),
                stop: stop.clone(),
                days,
            },
            reply: time_prompt(),
        },
        Err(_) => Transition::stay(
            step,
            days_prompt("Please choose <b>Weekdays</b> or <b>Everyday</b>.".to_string()),
        ),
    }
}

fn on_time(
    step: &Step,
    owner_id: i64,
    service_no: &str,
    stop: &BusStop,
    days: DaysMode,
    input: &str,
) -> Transition {
    match parse_trigger_time(input) {
        Ok(time) => Transition::Complete(NewReminder {
            owner_id,
            service_no: service_no.to_string(),
            stop_code: stop.code.clone(),
            stop_name: stop.display_name(),
            days,
            time,
        }),
        Err(e) => {
            debug!("Rejected time {:?}: {}", input, e);
            Transition::stay(
                step,
                Reply::text(
                    "Invalid time format!\nPlease enter in HH:MM (24-hour) format.\nExample: 07:30 or 18:45",
                ),
            )
        }
    }
}

struct Session {
    step: Step,
    touched: Instant,
}

/// In-flight setups keyed by chat id, expiring after `ttl` of inactivity.
///
/// The dispatcher handles one update per chat at a time, so a step taken
/// out with [`SessionTable::take`] is never raced by the same chat.
pub struct SessionTable {
    ttl: Duration,
    sessions: Mutex<HashMap<i64, Session>>,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin (or restart) a setup.
    pub async fn start(&self, chat_id: i64, now: Instant) {
        self.put(chat_id, Step::AwaitService, now).await;
    }

    pub async fn put(&self, chat_id: i64, step: Step, now: Instant) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(chat_id, Session { step, touched: now });
    }

    /// Remove and return the chat's live step.
    pub async fn take(&self, chat_id: i64, now: Instant) -> Option<Step> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.remove(&chat_id)?;
        if self.expired(&session, now) {
            debug!("Session for {} expired", chat_id);
            return None;
        }
        Some(session.step)
    }

    /// The chat's live step, left in place.
    pub async fn peek(&self, chat_id: i64, now: Instant) -> Option<Step> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&chat_id)
            .filter(|s| !self.expired(s, now))
            .map(|s| s.step.clone())
    }

    /// Drop the chat's session. Returns whether a live one existed.
    pub async fn cancel(&self, chat_id: i64, now: Instant) -> bool {
        self.take(chat_id, now).await.is_some()
    }

    /// Remove abandoned sessions. Returns how many were dropped.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| now.saturating_duration_since(s.touched) < self.ttl);
        let dropped = before - sessions.len();
        if dropped > 0 {
            info!("Swept {} abandoned setup session(s)", dropped);
        }
        dropped
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn expired(&self, session: &Session, now: Instant) -> bool {
        now.saturating_duration_since(session.touched) >= self.ttl
    }
}
