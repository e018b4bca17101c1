//! Outbound message types and formatting.
//!
//! All text is Telegram HTML; anything that came from a user or from the
//! transit API goes through [`escape`] first.

use chrono::{DateTime, Utc};
use teloxide::utils::html::escape;

use crate::bot::reminders::Reminder;
use crate::bot::transit::{ArrivalPrediction, BusStop};

/// An inline keyboard button. `data` is fed back as if the user typed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Rendered one button per row.
    pub buttons: Vec<Button>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_button(mut self, label: &str, data: &str) -> Self {
        self.buttons.push(Button {
            label: label.to_string(),
            data: data.to_string(),
        });
        self
    }
}

/// "Blk 123 (83139)" with HTML escaping.
pub fn stop_label(name: &str, code: &str) -> String {
    format!("{} ({})", escape(name), escape(code))
}

/// One line of `/list` output.
pub fn format_reminder_line(r: &Reminder) -> String {
    format!(
        "{}. Bus {} | {} | {} | {}",
        r.seq,
        escape(&r.service_no),
        stop_label(&r.stop_name, &r.stop_code),
        r.days.label(),
        r.time
    )
}

pub fn format_reminder_details(r: &Reminder) -> String {
    format!(
        "Bus: <b>{}</b>\nStop: <b>{}</b>\nDays: <b>{}</b>\nTime: <b>{}</b>",
        escape(&r.service_no),
        stop_label(&r.stop_name, &r.stop_code),
        r.days.label(),
        r.time
    )
}

fn urgency(minutes: i64) -> &'static str {
    if minutes <= 2 {
        "<b>RUN! The bus is arriving soon!</b>"
    } else if minutes <= 5 {
        "<b>Bus is coming shortly</b>"
    } else {
        "You have some time."
    }
}

fn arrival_extras(a: &ArrivalPrediction) -> String {
    let mut extras: Vec<&str> = Vec::new();
    if let Some(crowd) = a.crowd {
        extras.push(crowd.describe());
    }
    if let Some(bus_type) = a.bus_type {
        extras.push(bus_type.describe());
    }
    if a.wheelchair_accessible {
        extras.push("♿");
    }
    if extras.is_empty() {
        String::new()
    } else {
        format!(" ({})", extras.join(", "))
    }
}

/// Reminder notification body. `arrivals` is ordered soonest first and may
/// be empty when no buses are currently predicted.
pub fn format_arrivals(
    service_no: &str,
    stop_name: &str,
    stop_code: &str,
    arrivals: &[ArrivalPrediction],
    now: DateTime<Utc>,
) -> String {
    let mut msg = format!(
        "🚌 <b>Bus {} Arrival Info</b>\n📍 {}\n",
        escape(service_no),
        stop_label(stop_name, stop_code)
    );

    let Some(first) = arrivals.first() else {
        msg.push_str("No arrival data available right now.");
        return msg;
    };

    for (label, arrival) in ["Next bus", "Second bus", "Third bus"].iter().zip(arrivals) {
        msg.push_str(&format!(
            "{}: <b>{} min</b>{}\n",
            label,
            arrival.minutes_from(now),
            arrival_extras(arrival)
        ));
    }
    msg.push('\n');
    msg.push_str(urgency(first.minutes_from(now)));
    msg
}

/// A page of a service's stops. `more_command` is what the user sends for
/// another page, e.g. "/buslist" or "/buslist 965".
pub fn format_stop_page(
    service_no: &str,
    stops: &[BusStop],
    page: usize,
    page_size: usize,
    more_command: &str,
) -> String {
    let page_size = page_size.max(1);
    let pages = stops.len().div_ceil(page_size).max(1);
    if page == 0 || page > pages {
        return format!("There is no page {page}. Bus {} has {pages} page(s) of stops.", escape(service_no));
    }

    let mut msg = format!(
        "<b>Stops on bus {}</b> (page {}/{})\n",
        escape(service_no),
        page,
        pages
    );
    let mut direction = None;
    for stop in stops.iter().skip((page - 1) * page_size).take(page_size) {
        if direction != Some(stop.direction) {
            direction = Some(stop.direction);
            msg.push_str(&format!("<i>Direction {}</i>\n", stop.direction));
        }
        msg.push_str(&format!(
            "<code>{}</code> {}\n",
            escape(&stop.code),
            escape(&stop.display_name())
        ));
    }
    if page < pages {
        msg.push_str(&format!("\nSend {} {} for more.", more_command, page + 1));
    }
    msg
}
