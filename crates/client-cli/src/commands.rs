//! Interactive command parser. Item numbers are 1-based as displayed.

use anyhow::{anyhow, bail, Context, Result};
use shared::{TagColor, Theme};

pub const HELP: &str = "\
Lists:    lists | use <n> | use none | new-list <name> | rename <name> | delete-list | leave
Todos:    show | add <text> | done <n> | rm <n> | clear-done
Tags:     tags | tag <color> <name> | edit-tag <n> <color> <name> | rm-tag <n>
          link <todo> <tag> | unlink <todo> <tag> | pending <tag>
Filter:   filter <tag> | filter clear
Sharing:  invite | invites | revoke <n> | members | kick <n> | join <token>
Profile:  profile | name <display name> | theme [mono|natural|brutal]
Other:    help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Quit,
    Show,
    Lists,
    Use(Option<usize>),
    NewList(String),
    Rename(String),
    DeleteList,
    Leave,
    Add(String),
    Toggle(usize),
    Remove(usize),
    ClearDone,
    Tags,
    NewTag { color: TagColor, name: String },
    EditTag { tag: usize, color: TagColor, name: String },
    RemoveTag(usize),
    Link { todo: usize, tag: usize },
    Unlink { todo: usize, tag: usize },
    Pending(usize),
    Filter(Option<usize>),
    Invite,
    Invites,
    Revoke(usize),
    Members,
    Kick(usize),
    Join(String),
    Profile,
    Name(String),
    Theme(Option<Theme>),
}

fn index(arg: Option<&str>) -> Result<usize> {
    let arg = arg.context("Missing item number")?;
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => bail!("Not an item number: {}", arg),
    }
}

fn text(rest: &str, what: &str) -> Result<String> {
    let rest = rest.trim();
    if rest.is_empty() {
        bail!("Missing {}", what);
    }
    Ok(rest.to_string())
}

fn color(arg: Option<&str>) -> Result<TagColor> {
    let arg = arg.context("Missing tag color")?;
    Ok(arg.parse::<TagColor>()?)
}

/// Parse one input line. Blank lines give `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match word {
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        "show" | "ls" => Command::Show,
        "lists" => Command::Lists,
        "use" => match rest {
            "none" => Command::Use(None),
            _ => Command::Use(Some(index(args.next())?)),
        },
        "new-list" => Command::NewList(text(rest, "list name")?),
        // Blank names are passed through; the engine ignores them
        "rename" => Command::Rename(rest.to_string()),
        "delete-list" => Command::DeleteList,
        "leave" => Command::Leave,
        "add" => Command::Add(text(rest, "todo text")?),
        "done" => Command::Toggle(index(args.next())?),
        "rm" => Command::Remove(index(args.next())?),
        "clear-done" => Command::ClearDone,
        "tags" => Command::Tags,
        "tag" => {
            let color = color(args.next())?;
            let name = text(&args.collect::<Vec<_>>().join(" "), "tag name")?;
            Command::NewTag { color, name }
        }
        "edit-tag" => {
            let tag = index(args.next())?;
            let color = color(args.next())?;
            let name = text(&args.collect::<Vec<_>>().join(" "), "tag name")?;
            Command::EditTag { tag, color, name }
        }
        "rm-tag" => Command::RemoveTag(index(args.next())?),
        "link" | "unlink" => {
            let todo = index(args.next())?;
            let tag = index(args.next())?;
            if word == "link" {
                Command::Link { todo, tag }
            } else {
                Command::Unlink { todo, tag }
            }
        }
        "pending" => Command::Pending(index(args.next())?),
        "filter" => match rest {
            "clear" | "" => Command::Filter(None),
            _ => Command::Filter(Some(index(args.next())?)),
        },
        "invite" => Command::Invite,
        "invites" => Command::Invites,
        "revoke" => Command::Revoke(index(args.next())?),
        "members" => Command::Members,
        "kick" => Command::Kick(index(args.next())?),
        "join" => Command::Join(text(rest, "invite token")?),
        "profile" => Command::Profile,
        "name" => Command::Name(rest.to_string()),
        "theme" => match args.next() {
            None => Command::Theme(None),
            Some(name) => Command::Theme(Some(
                name.parse::<Theme>().map_err(|_| anyhow!("Unknown theme: {}", name))?,
            )),
        },
        other => bail!("Unknown command: {} (try 'help')", other),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(line: &str) -> Command {
        parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_blank_line() {
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_text_arguments_keep_spaces() {
        assert_eq!(ok("add  Buy oat milk "), Command::Add("Buy oat milk".to_string()));
        assert_eq!(ok("new-list Weekend trip"), Command::NewList("Weekend trip".to_string()));
        assert_eq!(ok("rename"), Command::Rename(String::new()));
        assert!(parse("add").is_err());
    }

    #[test]
    fn test_indices_are_one_based() {
        assert_eq!(ok("done 1"), Command::Toggle(0));
        assert_eq!(ok("link 2 3"), Command::Link { todo: 1, tag: 2 });
        assert_eq!(ok("use none"), Command::Use(None));
        assert!(parse("done 0").is_err());
        assert!(parse("done x").is_err());
        assert!(parse("unlink 1").is_err());
    }

    #[test]
    fn test_tag_commands() {
        assert_eq!(
            ok("tag red Very urgent"),
            Command::NewTag {
                color: TagColor::Red,
                name: "Very urgent".to_string()
            }
        );
        assert_eq!(
            ok("edit-tag 2 GREEN Done soon"),
            Command::EditTag {
                tag: 1,
                color: TagColor::Green,
                name: "Done soon".to_string()
            }
        );
        assert!(parse("tag cyan Later").is_err());
        assert!(parse("tag red").is_err());
    }

    #[test]
    fn test_filter_and_theme() {
        assert_eq!(ok("filter clear"), Command::Filter(None));
        assert_eq!(ok("filter 4"), Command::Filter(Some(3)));
        assert_eq!(ok("theme"), Command::Theme(None));
        assert_eq!(ok("theme mono"), Command::Theme(Some(Theme::Mono)));
        assert!(parse("theme neon").is_err());
        assert!(parse("frobnicate").is_err());
    }
}
