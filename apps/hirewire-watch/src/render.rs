//! Plain-text output

use hirewire_client::{badge_label, PanelItem, SurfaceRole};
use hirewire_core::StoreSnapshot;

pub const HELP: &str = "commands: o = open panel, l = list, r = refresh, q = quit";

pub fn print_summary(role: SurfaceRole, snapshot: &StoreSnapshot) {
    let badge = badge_label(snapshot.unread_count).unwrap_or_else(|| "0".to_string());
    let newest = snapshot
        .entries
        .first()
        .map(|entry| role.headline(entry))
        .unwrap_or_default();
    println!(
        "[{}] {} unread of {} ({}) {}",
        role,
        badge,
        snapshot.entries.len(),
        snapshot.connection_state,
        newest
    );
}

pub fn print_panel(items: &[PanelItem]) {
    if items.is_empty() {
        println!("  no notifications");
        return;
    }
    for item in items {
        let marker = if item.is_read { ' ' } else { '*' };
        println!("{} {:>10}  {}", marker, item.age, item.headline);
    }
}
