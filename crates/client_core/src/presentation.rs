//! Display helpers for channel lists and message timestamps.

use chrono::{DateTime, Local, TimeZone, Utc};
use shared::protocol::ChannelData;

const UNKNOWN_CHAT: &str = "Unknown Chat";

/// "First Last" for a one-to-one channel, the participants' first names for a
/// group, with usernames standing in for missing names.
pub fn channel_display_name(channel: &ChannelData) -> String {
    match channel.other_users.as_slice() {
        [] => UNKNOWN_CHAT.to_string(),
        [user] => match &user.profile {
            Some(profile) if !profile.first_name.is_empty() && !profile.last_name.is_empty() => {
                format!("{} {}", profile.first_name, profile.last_name)
            }
            _ => user.username.clone(),
        },
        users => users
            .iter()
            .map(|user| match &user.profile {
                Some(profile) if !profile.first_name.is_empty() => profile.first_name.as_str(),
                _ => user.username.as_str(),
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Profile picture of the only other participant; groups have none.
pub fn channel_avatar(channel: &ChannelData) -> Option<&str> {
    match channel.other_users.as_slice() {
        [user] => user.profile.as_ref()?.profile_picture.as_deref(),
        _ => None,
    }
}

/// Relative label for a message time as seen at `now`.
///
/// Whole elapsed days decide the format: same day shows `HH:MM`, one day
/// "Yesterday", under a week the short weekday, anything older the short
/// month and day.
pub fn format_message_time<Tz>(timestamp: DateTime<Utc>, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let local = timestamp.with_timezone(&now.timezone());
    let elapsed_days = (now.clone() - local.clone()).num_seconds().div_euclid(86_400);

    match elapsed_days {
        days if days <= 0 => local.format("%H:%M").to_string(),
        1 => "Yesterday".to_string(),
        days if days < 7 => local.format("%a").to_string(),
        _ => local.format("%b %-d").to_string(),
    }
}

/// [`format_message_time`] against the local clock.
pub fn format_message_time_now(timestamp: DateTime<Utc>) -> String {
    format_message_time(timestamp, Local::now())
}

#[cfg(test)]
#[path = "tests/presentation_tests.rs"]
mod tests;
