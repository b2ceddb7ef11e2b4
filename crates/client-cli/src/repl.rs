//! Interactive loop: stdin commands and engine updates on one task.

use anyhow::{Context, Result};
use shared::{InviteToken, ListMember, Theme};
use tasklist_sync::{SyncEngine, SyncError, Update};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use uuid::Uuid;

use crate::commands::{self, Command, HELP};
use crate::render;

pub struct Repl {
    engine: SyncEngine,
    /// Last listing shown, so `revoke <n>` and `kick <n>` resolve against it
    invites: Vec<InviteToken>,
    members: Vec<ListMember>,
}

/// Whether the loop should keep going
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

impl Repl {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            invites: Vec::new(),
            members: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = LinesStream::new(stdin.lines());

        println!("{}", render::lists(self.engine.lists(), self.engine.selection().list_id(), self.engine.user_id()));
        println!("Type 'help' for commands.");

        loop {
            tokio::select! {
                line = lines.next() => {
                    let Some(line) = line else { break };
                    if self.handle_line(&line?).await == Flow::Quit {
                        break;
                    }
                }
                update = self.engine.step() => self.show_update(update),
            }
        }

        tracing::debug!("Leaving interactive loop");
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let command = match commands::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                eprintln!("{}", e);
                return Flow::Continue;
            }
        };
        if command == Command::Quit {
            return Flow::Quit;
        }
        if let Err(e) = self.execute(command).await {
            eprintln!("Error: {}", e);
        }
        Flow::Continue
    }

    fn show_update(&self, update: Update) {
        match update {
            Update::Lists => println!(
                "{}",
                render::lists(self.engine.lists(), self.engine.selection().list_id(), self.engine.user_id())
            ),
            Update::Selected(Some(_)) => println!("{}", render::scope(&self.engine)),
            Update::Selected(None) => println!("No list selected."),
            Update::Loaded(_) | Update::Todos | Update::Tags => {
                println!("{}", render::scope(&self.engine))
            }
            Update::LoadFailed(_) => eprintln!("Could not load the list. Try 'use' again."),
            Update::FeedClosed(collection) => {
                tracing::warn!("Live updates for {} stopped", collection)
            }
            Update::Fetching | Update::Stale | Update::Ignored => {}
        }
    }

    fn selected(&self) -> Result<Uuid, SyncError> {
        self.engine.selection().list_id().ok_or(SyncError::NoListSelected)
    }

    fn todo_at(&self, index: usize) -> Result<Uuid> {
        self.engine
            .visible_todos()
            .get(index)
            .map(|item| item.todo.id)
            .with_context(|| format!("No todo #{}", index + 1))
    }

    fn tag_at(&self, index: usize) -> Result<Uuid> {
        self.engine
            .tags()
            .get(index)
            .map(|tag| tag.id)
            .with_context(|| format!("No tag #{}", index + 1))
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
            Command::Show => println!("{}", render::scope(&self.engine)),
            Command::Lists => println!(
                "{}",
                render::lists(self.engine.lists(), self.engine.selection().list_id(), self.engine.user_id())
            ),
            Command::Use(index) => {
                let list_id = match index {
                    Some(i) => Some(
                        self.engine
                            .lists()
                            .get(i)
                            .map(|list| list.id)
                            .with_context(|| format!("No list #{}", i + 1))?,
                    ),
                    None => None,
                };
                self.engine.select_list(list_id)?;
            }
            Command::NewList(name) => {
                let list = self.engine.create_list(&name).await?;
                println!("Created list '{}'", list.name);
            }
            Command::Rename(name) => {
                let list_id = self.selected()?;
                self.engine.rename_list(list_id, &name).await?;
            }
            Command::DeleteList => {
                let list_id = self.selected()?;
                self.engine.delete_list(list_id).await?;
                println!("List deleted");
            }
            Command::Leave => {
                let list_id = self.selected()?;
                self.engine.leave_list(list_id).await?;
                println!("You left the list");
            }
            Command::Add(text) => {
                self.engine.add_todo(&text).await?;
                println!("{}", render::scope(&self.engine));
            }
            Command::Toggle(index) => {
                let todo_id = self.todo_at(index)?;
                self.engine.toggle_todo(todo_id).await?;
                println!("{}", render::scope(&self.engine));
            }
            Command::Remove(index) => {
                let todo_id = self.todo_at(index)?;
                self.engine.delete_todo(todo_id).await?;
                println!("{}", render::scope(&self.engine));
            }
            Command::ClearDone => {
                let removed = self.engine.clear_completed().await?;
                println!("Removed {} completed todos", removed);
            }
            Command::Tags => println!("{}", render::tags(self.engine.tags())),
            Command::NewTag { color, name } => {
                let tag = self.engine.create_tag(&name, color).await?;
                println!("Created {}", render::chip(&tag));
            }
            Command::EditTag { tag, color, name } => {
                let tag_id = self.tag_at(tag)?;
                let tag = self.engine.update_tag(tag_id, &name, color).await?;
                println!("Updated {}", render::chip(&tag));
            }
            Command::RemoveTag(index) => {
                let tag_id = self.tag_at(index)?;
                self.engine.delete_tag(tag_id).await?;
                println!("Tag deleted");
            }
            Command::Link { todo, tag } => {
                let (todo_id, tag_id) = (self.todo_at(todo)?, self.tag_at(tag)?);
                self.engine.link_tag(todo_id, tag_id).await?;
            }
            Command::Unlink { todo, tag } => {
                let (todo_id, tag_id) = (self.todo_at(todo)?, self.tag_at(tag)?);
                self.engine.unlink_tag(todo_id, tag_id).await?;
            }
            Command::Pending(index) => {
                let tag_id = self.tag_at(index)?;
                self.engine.toggle_pending_tag(tag_id)?;
                println!("{}", render::scope(&self.engine));
            }
            Command::Filter(Some(index)) => {
                let tag_id = self.tag_at(index)?;
                self.engine.toggle_filter_tag(tag_id)?;
                println!("{}", render::scope(&self.engine));
            }
            Command::Filter(None) => {
                self.engine.clear_filter();
                println!("{}", render::scope(&self.engine));
            }
            Command::Invite => {
                let list_id = self.selected()?;
                let invite = self.engine.create_invite(list_id).await?;
                println!("Invite token: {}", invite.token);
                println!("Share it with: tasklists accept {}", invite.token);
            }
            Command::Invites => {
                let list_id = self.selected()?;
                self.invites = self.engine.active_invites(list_id).await?;
                println!("{}", render::invites(&self.invites));
            }
            Command::Revoke(index) => {
                let invite_id = self
                    .invites
                    .get(index)
                    .map(|invite| invite.id)
                    .with_context(|| format!("No invite #{} (run 'invites' first)", index + 1))?;
                self.engine.deactivate_invite(invite_id).await?;
                self.invites.remove(index);
                println!("Invite revoked");
            }
            Command::Members => {
                let list_id = self.selected()?;
                self.members = self.engine.list_members(list_id).await?;
                println!("{}", render::members(&self.members));
            }
            Command::Kick(index) => {
                let list_id = self.selected()?;
                let member = self
                    .members
                    .get(index)
                    .cloned()
                    .with_context(|| format!("No member #{} (run 'members' first)", index + 1))?;
                self.engine.remove_member(list_id, member.user_id).await?;
                self.members.remove(index);
                println!("Removed {}", member.label());
            }
            Command::Join(token) => {
                let info = self.engine.invite_info(&token).await?;
                println!("Joining '{}'...", info.list_name);
                self.engine.accept_invite(&token).await?;
            }
            Command::Profile => match self.engine.profile().await? {
                Some(profile) => println!("Display name: {}", profile.display_name),
                None => println!("No display name set. Set one with: name <display name>"),
            },
            Command::Name(name) => {
                let profile = self.engine.save_profile(&name).await?;
                println!("Display name set to {}", profile.display_name);
            }
            Command::Theme(None) => {
                let current = self.engine.theme();
                for theme in Theme::ALL {
                    let marker = if theme == current { '*' } else { ' ' };
                    println!(
                        "{} {:<8} {}",
                        marker,
                        render::accent(theme, theme.as_str()),
                        theme.description()
                    );
                }
            }
            Command::Theme(Some(theme)) => {
                self.engine.set_theme(theme);
                println!("Theme set to {}", theme);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tasklist_sync::{MemoryBackend, MemoryPreferences, Phase};

    async fn repl(backend: &MemoryBackend, email: &str) -> Repl {
        let user = backend.add_user(email);
        let mut engine = SyncEngine::new(
            Arc::new(backend.session(user)),
            Box::new(MemoryPreferences::default()),
        );
        engine.start().await.unwrap();
        Repl::new(engine)
    }

    async fn settle(repl: &mut Repl) {
        while tokio::time::timeout(Duration::from_millis(50), repl.engine.step())
            .await
            .is_ok()
        {}
    }

    async fn run(repl: &mut Repl, line: &str) {
        assert_eq!(repl.handle_line(line).await, Flow::Continue);
    }

    #[tokio::test]
    async fn test_commands_drive_the_engine() {
        let backend = MemoryBackend::new();
        let mut repl = repl(&backend, "alice@example.com").await;

        run(&mut repl, "new-list Groceries").await;
        settle(&mut repl).await;
        assert_eq!(repl.engine.phase(), Phase::Ready);

        run(&mut repl, "add Buy milk").await;
        run(&mut repl, "add Buy eggs").await;
        run(&mut repl, "done 2").await;
        assert_eq!(repl.engine.completed_count(), 1);
        assert!(repl.engine.todos()[1].todo.completed);

        run(&mut repl, "tag red Urgent").await;
        run(&mut repl, "link 1 1").await;
        settle(&mut repl).await;
        assert_eq!(repl.engine.todos()[0].tags.len(), 1);

        run(&mut repl, "filter 1").await;
        assert_eq!(repl.engine.visible_todos().len(), 1);

        run(&mut repl, "clear-done").await;
        assert_eq!(repl.engine.total_count(), 1);
        assert_eq!(repl.handle_line("quit").await, Flow::Quit);
    }

    #[tokio::test]
    async fn test_bad_input_keeps_running() {
        let backend = MemoryBackend::new();
        let mut repl = repl(&backend, "alice@example.com").await;

        run(&mut repl, "bogus").await;
        run(&mut repl, "done 3").await;
        run(&mut repl, "add Nothing selected").await;
        assert_eq!(repl.engine.total_count(), 0);
    }

    #[tokio::test]
    async fn test_invite_and_kick_use_last_listing() {
        let backend = MemoryBackend::new();
        let mut owner = repl(&backend, "alice@example.com").await;
        run(&mut owner, "new-list Trip").await;
        let list_id = owner.engine.selection().list_id().unwrap();
        let invite = owner.engine.create_invite(list_id).await.unwrap();

        let mut guest = repl(&backend, "bob@example.com").await;
        run(&mut guest, &format!("join {}", invite.token)).await;
        assert_eq!(guest.engine.selection().list_id(), Some(list_id));

        run(&mut owner, "kick 1").await;
        assert_eq!(owner.engine.list_members(list_id).await.unwrap().len(), 2);

        run(&mut owner, "members").await;
        assert_eq!(owner.members.len(), 2);
        run(&mut owner, "kick 2").await;
        assert_eq!(owner.engine.list_members(list_id).await.unwrap().len(), 1);

        run(&mut owner, "invites").await;
        assert_eq!(owner.invites.len(), 1);
        run(&mut owner, "revoke 1").await;
        assert!(owner.engine.active_invites(list_id).await.unwrap().is_empty());
    }
}
