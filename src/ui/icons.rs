//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[KILLED]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Progress indicators
pub static HAMMER: Emoji<'_, '_> = Emoji("🔨 ", "[BUILD]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
