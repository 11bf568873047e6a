//! Platform surface for reading foreign application UI trees.
//!
//! The router never talks to a UI automation API directly. It goes through
//! the [`Desktop`] trait, which exposes just enough of a window/element tree
//! to locate elements and read their text.
//!
//! - **Windows**: UI Automation via the `uiautomation` crate
//! - **Other platforms**: [`NullDesktop`], which reports no windows
//! - **Tests and dry runs**: [`ScriptedDesktop`], an in-memory tree

pub mod scripted;

#[cfg(target_os = "windows")]
pub mod windows;

pub use scripted::{ReadBehavior, ScriptedDesktop, ScriptedElement};

/// Errors reported by a platform back end
#[derive(Debug, thiserror::Error)]
pub enum DesktopError {
    #[error("Element no longer available")]
    ElementUnavailable,

    #[error("Property {0:?} not supported by element")]
    PropertyUnavailable(Property),

    #[error("UI automation error: {0}")]
    Backend(String),
}

/// Element property that can be read as text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Accessible name; most labels expose their text here
    Name,
    /// Value pattern text (edit boxes, some web nodes)
    Value,
    AutomationId,
    ClassName,
}

/// Read access to a foreign element tree.
///
/// Any call may be slow or hang when the owning application is busy; callers
/// wrap reads and searches in [`crate::bounded`] operations.
pub trait Desktop: Send + Sync + 'static {
    /// Handle to one element. Must be cheap to clone and movable to the
    /// short-lived threads that perform bounded reads.
    type Element: Clone + Send + 'static;

    /// Top-level application windows
    fn top_level_windows(&self) -> Vec<Self::Element>;

    /// Direct children of an element, in document order
    fn children(&self, element: &Self::Element) -> Vec<Self::Element>;

    /// Read one property as text
    fn property(&self, element: &Self::Element, property: Property) -> Result<String, DesktopError>;

    /// Whether the element currently has keyboard focus or is the selected item
    fn has_focus(&self, element: &Self::Element) -> bool;

    /// Whether the element (and its owning window) still exists
    fn is_alive(&self, element: &Self::Element) -> bool;
}

/// Desktop used where no UI automation back end exists
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDesktop;

impl Desktop for NullDesktop {
    type Element = ();

    fn top_level_windows(&self) -> Vec<()> {
        vec![]
    }

    fn children(&self, _element: &()) -> Vec<()> {
        vec![]
    }

    fn property(&self, _element: &(), _property: Property) -> Result<String, DesktopError> {
        Err(DesktopError::ElementUnavailable)
    }

    fn has_focus(&self, _element: &()) -> bool {
        false
    }

    fn is_alive(&self, _element: &()) -> bool {
        false
    }
}
