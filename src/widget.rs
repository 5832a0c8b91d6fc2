use eframe::egui::{Button, Color32, Label, RichText, Rounding};

use hrbridge::session::SessionState;


pub fn get_heart_rate_label(heart_rate: Option<u8>) -> Label {
    let text = match heart_rate {
        Some(bpm) => format!("HR: {bpm}"),
        None => "HR: --".to_string(),
    };
    let live_hr_text = RichText::new(text)
        .color(Color32::RED)
        .background_color(Color32::WHITE)
        .size(40.0);

    Label::new(live_hr_text)
}

pub fn get_battery_label(battery: Option<u8>) -> Label {
    let text = match battery {
        Some(percent) => format!("Battery: {percent}%"),
        None => "Battery: --".to_string(),
    };
    let color = match battery {
        Some(percent) if percent <= 15 => Color32::RED,
        _ => Color32::GRAY,
    };

    Label::new(RichText::new(text).color(color).size(20.0))
}

pub fn get_state_label(state: &SessionState, device: Option<&str>) -> Label {
    let (text, color) = match state {
        SessionState::Idle => ("Idle".to_string(), Color32::GRAY),
        SessionState::Discovering => ("Scanning...".to_string(), Color32::YELLOW),
        SessionState::Connected => (format!("Connected to {}", device.unwrap_or("?")), Color32::LIGHT_BLUE),
        SessionState::Streaming => (format!("Streaming from {}", device.unwrap_or("?")), Color32::GREEN),
        SessionState::Stopping => ("Stopping...".to_string(), Color32::YELLOW),
        SessionState::Failed(reason) => (format!("Failed: {reason}"), Color32::RED),
    };

    Label::new(RichText::new(text).color(color).size(20.0))
}

pub fn get_subscriber_label(count: usize, listening: Option<&str>) -> Label {
    let text = match listening {
        Some(addr) => format!("{count} subscriber(s) on ws://{addr}"),
        None => format!("{count} subscriber(s)"),
    };

    Label::new(RichText::new(text).size(16.0))
}

pub fn get_start_button() -> Button<'static> {
    let text = RichText::new("Connect & stream")
        .color(Color32::WHITE)
        .size(20.0);

    Button::new(text)
        .fill(Color32::BLUE)
        .rounding(Rounding::same(8.0))
}

pub fn get_stop_button() -> Button<'static> {
    let text = RichText::new("Stop")
        .color(Color32::RED)
        .background_color(Color32::WHITE)
        .size(20.0);

    Button::new(text)
        .fill(Color32::BLUE)
        .rounding(Rounding::same(8.0))
}
