use shared::Theme;
use uuid::Uuid;

/// Small key-value state that survives a restart.
///
/// Implementations log their own persistence failures; the engine never
/// fails an operation because a preference could not be saved.
pub trait Preferences: Send {
    fn selected_list(&self) -> Option<Uuid>;
    fn set_selected_list(&mut self, list_id: Option<Uuid>);
    fn theme(&self) -> Theme;
    fn set_theme(&mut self, theme: Theme);
}

/// Non-persistent preferences for tests and throwaway sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    pub selected_list: Option<Uuid>,
    pub theme: Theme,
}

impl Preferences for MemoryPreferences {
    fn selected_list(&self) -> Option<Uuid> {
        self.selected_list
    }

    fn set_selected_list(&mut self, list_id: Option<Uuid>) {
        self.selected_list = list_id;
    }

    fn theme(&self) -> Theme {
        self.theme
    }

    fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
    }
}
