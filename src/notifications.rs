//! Windows toast notifications for event-log entries

use crate::events::{EventKind, EventRecord};

#[cfg(windows)]
use winrt_notification::{Duration, Sound, Toast};

/// App ID for toast notifications
/// Using PowerShell's AUMID for compatibility (custom app IDs require registration)
#[cfg(windows)]
const APP_ID: &str =
    "{1AC14E77-02E7-4E5D-B744-2EB1AE5198B7}\\WindowsPowerShell\\v1.0\\powershell.exe";

const TITLE: &str = "Bulletproof VPN";

/// Show a toast notification (Windows only, no-op on other platforms)
#[allow(unused_variables)]
pub fn show_notification(title: &str, message: &str, with_sound: bool) {
    #[cfg(windows)]
    {
        let sound = if with_sound { Some(Sound::Default) } else { None };
        if let Err(e) = Toast::new(APP_ID)
            .title(title)
            .text1(message)
            .sound(sound)
            .duration(Duration::Short)
            .show()
        {
            tracing::warn!("Failed to show notification: {}", e);
        }
    }
}

/// Mirror an event-log entry as a desktop toast
///
/// Successes chime; errors get a prefix so they stand out in the action center.
pub fn notify_event(record: &EventRecord) {
    match record.kind {
        EventKind::Info => show_notification(TITLE, &record.text, false),
        EventKind::Success => show_notification(TITLE, &record.text, true),
        EventKind::Error => {
            let message = format!("Error: {}", record.text);
            show_notification(TITLE, &message, false);
        }
    }
}
