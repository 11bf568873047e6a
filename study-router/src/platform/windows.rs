//! Windows UI Automation back end.

use super::{Desktop, DesktopError, Property};
use uiautomation::patterns::UIValuePattern;
use uiautomation::{UIAutomation, UIElement, UITreeWalker};

/// UI Automation element handle.
#[derive(Clone)]
pub struct UiaElement(UIElement);

// SAFETY: `UIAutomation::new` initializes COM in the multithreaded apartment,
// so element interfaces may be called from any thread of the process.
unsafe impl Send for UiaElement {}

/// Desktop backed by the system UI Automation client
pub struct UiaDesktop {
    automation: UIAutomation,
    walker: UITreeWalker,
}

// SAFETY: see `UiaElement`; the automation client and walker are MTA objects.
unsafe impl Send for UiaDesktop {}
unsafe impl Sync for UiaDesktop {}

impl UiaDesktop {
    pub fn new() -> Result<Self, DesktopError> {
        let automation = UIAutomation::new().map_err(backend)?;
        let walker = automation.get_control_view_walker().map_err(backend)?;
        Ok(Self { automation, walker })
    }

    fn walk_children(&self, parent: &UIElement) -> Vec<UiaElement> {
        let mut children = Vec::new();
        let mut next = self.walker.get_first_child(parent).ok();
        while let Some(child) = next {
            next = self.walker.get_next_sibling(&child).ok();
            children.push(UiaElement(child));
        }
        children
    }
}

impl Desktop for UiaDesktop {
    type Element = UiaElement;

    fn top_level_windows(&self) -> Vec<UiaElement> {
        match self.automation.get_root_element() {
            Ok(root) => self.walk_children(&root),
            Err(_) => vec![],
        }
    }

    fn children(&self, element: &UiaElement) -> Vec<UiaElement> {
        self.walk_children(&element.0)
    }

    fn property(&self, element: &UiaElement, property: Property) -> Result<String, DesktopError> {
        let element = &element.0;
        match property {
            Property::Name => element.get_name().map_err(backend),
            Property::AutomationId => element.get_automation_id().map_err(backend),
            Property::ClassName => element.get_classname().map_err(backend),
            Property::Value => {
                let pattern = element
                    .get_pattern::<UIValuePattern>()
                    .map_err(|_| DesktopError::PropertyUnavailable(Property::Value))?;
                pattern.get_value().map_err(backend)
            }
        }
    }

    fn has_focus(&self, element: &UiaElement) -> bool {
        element.0.has_keyboard_focus().unwrap_or(false)
    }

    fn is_alive(&self, element: &UiaElement) -> bool {
        element.0.get_name().is_ok()
    }
}

fn backend(e: uiautomation::Error) -> DesktopError {
    DesktopError::Backend(e.to_string())
}
