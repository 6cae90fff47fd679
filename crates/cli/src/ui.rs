use std::io::{self, IsTerminal, Write};

use anyhow::Context;
use checklist_sync::{Connectivity, SessionView};
use chrono::{DateTime, Utc};
use core_model::{ChecklistStats, Item};
use owo_colors::OwoColorize;
use recent::{RecentChecklist, format_last_visited};

pub fn color_enabled() -> bool {
    io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

pub fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    if color_enabled() {
        print!("{}", prompt.cyan());
    } else {
        print!("{prompt}");
    }
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim_end().to_string())
}

pub fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let answer = prompt_line(&format!("{prompt} [y/N]: "))?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Accepts a 1-based position as printed by `show`, a full item id, or an
/// unambiguous id prefix.
pub fn resolve_item<'a>(view: &'a SessionView, key: &str) -> anyhow::Result<&'a Item> {
    let key = key.trim();
    if let Ok(pos) = key.parse::<usize>()
        && (1..=view.items.len()).contains(&pos)
    {
        return Ok(&view.items[pos - 1]);
    }
    if let Some(item) = view.item(key) {
        return Ok(item);
    }
    let mut matches = view.items.iter().filter(|i| i.id.starts_with(key));
    match (matches.next(), matches.next()) {
        (Some(item), None) if !key.is_empty() => Ok(item),
        (Some(_), Some(_)) => Err(anyhow::anyhow!("item prefix {key:?} is ambiguous")),
        _ => Err(anyhow::anyhow!("no item matches {key:?}")),
    }
}

pub fn progress_label(stats: ChecklistStats) -> String {
    if stats.item_count == 0 {
        return "no items".to_string();
    }
    format!("{}/{} done", stats.completed_count, stats.item_count)
}

pub fn print_view(view: &SessionView, url: &str) {
    let use_color = color_enabled();
    let title = if use_color {
        view.title().bold().to_string()
    } else {
        view.title().to_string()
    };
    let progress = progress_label(view.stats());
    let progress = if use_color {
        progress.magenta().to_string()
    } else {
        progress
    };
    let url = if use_color {
        url.dimmed().to_string()
    } else {
        url.to_string()
    };
    println!("{title} ({progress})");
    println!("{url}");
    for (i, item) in view.items.iter().enumerate() {
        let mark = if item.completed { "[x]" } else { "[ ]" };
        let text = if use_color && item.completed {
            item.text.strikethrough().dimmed().to_string()
        } else {
            item.text.clone()
        };
        let id = short_id(&item.id);
        let id = if use_color {
            id.dimmed().to_string()
        } else {
            id.to_string()
        };
        println!("{:>3}. {mark} {text}  {id}", i + 1);
    }
}

pub fn print_recent(entries: &[RecentChecklist], now: DateTime<Utc>) {
    let use_color = color_enabled();
    if entries.is_empty() {
        println!("no recent checklists");
        return;
    }
    for (i, entry) in entries.iter().enumerate() {
        let title = truncate_text(&entry.title, 60);
        let title = if use_color {
            title.bold().to_string()
        } else {
            title
        };
        let visited = format_last_visited(entry.last_visited, now);
        let visited = if use_color {
            visited.dimmed().to_string()
        } else {
            visited
        };
        let progress = match (entry.item_count, entry.completed_count) {
            (Some(item_count), Some(completed_count)) => progress_label(ChecklistStats {
                item_count,
                completed_count,
            }),
            _ => "-".to_string(),
        };
        let separator = if use_color {
            " | ".dimmed().to_string()
        } else {
            " | ".to_string()
        };
        println!(
            "[{i}] {title}{separator}{}{separator}{progress}{separator}{visited}",
            entry.id
        );
        println!("    {}", entry.url);
    }
}

pub fn print_connectivity(state: Connectivity) {
    let label = format!("connection: {state}");
    if !color_enabled() {
        println!("{label}");
    } else if state.is_online() {
        println!("{}", label.green());
    } else {
        println!("{}", label.red());
    }
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn parse_watch_duration(raw: &str) -> anyhow::Result<std::time::Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))
}
