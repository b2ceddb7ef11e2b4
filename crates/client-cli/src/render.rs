//! Plain-text rendering with 24-bit ANSI colours.

use shared::{InviteToken, List, ListMember, Tag, Theme};
use std::fmt::Write;
use tasklist_sync::{Phase, SyncEngine, TodoItem};
use uuid::Uuid;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

fn hex_rgb(hex: &str) -> (u8, u8, u8) {
    let hex = hex.trim_start_matches('#');
    let channel = |i: usize| {
        hex.get(i..i + 2)
            .and_then(|c| u8::from_str_radix(c, 16).ok())
            .unwrap_or(0)
    };
    (channel(0), channel(2), channel(4))
}

fn fg((r, g, b): (u8, u8, u8)) -> String {
    format!("\x1b[38;2;{};{};{}m", r, g, b)
}

fn bg((r, g, b): (u8, u8, u8)) -> String {
    format!("\x1b[48;2;{};{};{}m", r, g, b)
}

/// Text in the theme's accent colour
pub fn accent(theme: Theme, text: &str) -> String {
    format!("{}{}{}{}", BOLD, fg(hex_rgb(theme.preview()[2])), text, RESET)
}

pub fn chip(tag: &Tag) -> String {
    format!("{}{} {} {}", bg(tag.color.rgb()), fg((255, 255, 255)), tag.name, RESET)
}

fn chips<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> String {
    tags.into_iter().map(chip).collect::<Vec<_>>().join(" ")
}

pub fn todo_line(number: usize, item: &TodoItem) -> String {
    let (mark, text) = if item.todo.completed {
        ("[x]", format!("{}{}{}", DIM, item.todo.text, RESET))
    } else {
        ("[ ]", item.todo.text.clone())
    };
    let mut line = format!("{:>3}. {} {}", number, mark, text);
    if !item.tags.is_empty() {
        line.push_str("  ");
        line.push_str(&chips(&item.tags));
    }
    line
}

pub fn lists(lists: &[List], selected: Option<Uuid>, user_id: Option<Uuid>) -> String {
    if lists.is_empty() {
        return "No lists yet. Create one with: new-list <name>".to_string();
    }
    let mut out = String::new();
    for (i, list) in lists.iter().enumerate() {
        let marker = if Some(list.id) == selected { '*' } else { ' ' };
        let shared = if Some(list.owner_id) == user_id { "" } else { "  (shared with you)" };
        let _ = writeln!(out, "{} {:>2}. {}{}", marker, i + 1, list.name, shared);
    }
    out.trim_end().to_string()
}

pub fn tags(tags: &[Tag]) -> String {
    if tags.is_empty() {
        return "No tags. Create one with: tag <color> <name>".to_string();
    }
    tags.iter()
        .enumerate()
        .map(|(i, tag)| format!("{:>3}. {}", i + 1, chip(tag)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Header, filter state and visible todos of the selected list
pub fn scope(engine: &SyncEngine) -> String {
    let theme = engine.theme();
    let Some(list) = engine.selected_list() else {
        return "No list selected. Pick one with: use <n>".to_string();
    };

    let mut out = String::new();
    let header = format!("{}  {}/{} done", list.name, engine.completed_count(), engine.total_count());
    let _ = writeln!(out, "{}", accent(theme, &header));

    if engine.phase() == Phase::Loading {
        out.push_str("  loading...");
        return out;
    }

    let filter: Vec<&Tag> = engine
        .tags()
        .iter()
        .filter(|t| engine.selection().filter().contains(&t.id))
        .collect();
    if !filter.is_empty() {
        let _ = writeln!(out, "  filter: {}", chips(filter));
    }
    let pending = engine.pending_tags();
    if !pending.is_empty() {
        let _ = writeln!(out, "  next todo gets: {}", chips(pending));
    }

    let visible = engine.visible_todos();
    if visible.is_empty() {
        out.push_str(if engine.total_count() == 0 {
            "  Nothing to do."
        } else {
            "  No todos match the filter."
        });
        return out;
    }
    for (i, item) in visible.iter().enumerate() {
        let _ = writeln!(out, "{}", todo_line(i + 1, item));
    }
    out.trim_end().to_string()
}

pub fn invites(invites: &[InviteToken]) -> String {
    if invites.is_empty() {
        return "No active invites.".to_string();
    }
    invites
        .iter()
        .enumerate()
        .map(|(i, invite)| {
            format!(
                "{:>3}. {}  expires {}",
                i + 1,
                invite.token,
                invite.expires_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn members(members: &[ListMember]) -> String {
    members
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let role = if member.is_owner { "  (owner)" } else { "" };
            format!("{:>3}. {}{}", i + 1, member.label(), role)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::{TagColor, Todo};

    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn tag(name: &str, color: TagColor) -> Tag {
        Tag {
            id: Uuid::new_v4(),
            list_id: Uuid::nil(),
            name: name.to_string(),
            color,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_hex_rgb() {
        assert_eq!(hex_rgb("#ff6b35"), (255, 107, 53));
        assert_eq!(hex_rgb("bad"), (0, 0, 0));
    }

    #[test]
    fn test_chip_uses_tag_color() {
        let urgent = tag("Urgent", TagColor::Red);
        let rendered = chip(&urgent);
        assert!(rendered.starts_with("\x1b[48;2;239;68;68m"));
        assert_eq!(strip_ansi(&rendered), " Urgent ");
    }

    #[test]
    fn test_todo_line() {
        let item = TodoItem {
            todo: Todo {
                id: Uuid::new_v4(),
                list_id: Uuid::nil(),
                text: "Buy milk".to_string(),
                completed: true,
                created_at: Utc::now(),
            },
            tags: vec![tag("Urgent", TagColor::Red), tag("Home", TagColor::Green)],
        };
        assert_eq!(strip_ansi(&todo_line(2, &item)), "  2. [x] Buy milk   Urgent   Home ");
    }

    #[test]
    fn test_lists_marks_selection_and_shared() {
        let me = Uuid::new_v4();
        let mine = List {
            id: Uuid::new_v4(),
            owner_id: me,
            name: "Groceries".to_string(),
            created_at: Utc::now(),
        };
        let theirs = List {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "Trip".to_string(),
            created_at: Utc::now(),
        };
        let rendered = lists(&[mine.clone(), theirs], Some(mine.id), Some(me));
        assert_eq!(rendered, "*  1. Groceries\n   2. Trip  (shared with you)");
        assert!(lists(&[], None, Some(me)).starts_with("No lists"));
    }
}
