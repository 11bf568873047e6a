//! In-memory element tree.
//!
//! Stands in for a reporting application's UI tree in tests and dry runs.
//! Reads on individual elements can be scripted to fail, panic, or stall,
//! which is how the bounded reader and locator recovery paths are exercised.

use super::{Desktop, DesktopError, Property};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Handle to a node of a [`ScriptedDesktop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptedElement(usize);

/// How property reads on a node behave
#[derive(Debug, Clone, PartialEq)]
pub enum ReadBehavior {
    Normal,
    /// Return a backend error
    Fail,
    /// Block the reading thread before answering
    Delay(Duration),
    /// Panic inside the read
    Panic,
}

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    props: HashMap<Property, String>,
    focused: bool,
    alive: bool,
    behavior: ReadBehavior,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: Vec<Node>,
    windows: Vec<usize>,
}

/// Scriptable desktop
#[derive(Debug, Default)]
pub struct ScriptedDesktop {
    tree: Mutex<Tree>,
    reads: AtomicUsize,
}

impl ScriptedDesktop {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_node(tree: &mut Tree, parent: Option<usize>, name: &str) -> usize {
        let mut props = HashMap::new();
        props.insert(Property::Name, name.to_string());
        let id = tree.nodes.len();
        tree.nodes.push(Node {
            parent,
            children: Vec::new(),
            props,
            focused: false,
            alive: true,
            behavior: ReadBehavior::Normal,
        });
        id
    }

    /// Add a top-level window with the given title
    pub fn add_window(&self, title: &str) -> ScriptedElement {
        let mut tree = self.tree();
        let id = Self::push_node(&mut tree, None, title);
        tree.windows.push(id);
        ScriptedElement(id)
    }

    /// Append a child element whose name is `name`
    pub fn add_child(&self, parent: ScriptedElement, name: &str) -> ScriptedElement {
        let mut tree = self.tree();
        let id = Self::push_node(&mut tree, Some(parent.0), name);
        if let Some(node) = tree.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        ScriptedElement(id)
    }

    /// Append a child element carrying an automation id
    pub fn add_labeled(&self, parent: ScriptedElement, automation_id: &str, name: &str) -> ScriptedElement {
        let element = self.add_child(parent, name);
        self.set_property(element, Property::AutomationId, automation_id);
        element
    }

    pub fn set_property(&self, element: ScriptedElement, property: Property, value: &str) {
        if let Some(node) = self.tree().nodes.get_mut(element.0) {
            node.props.insert(property, value.to_string());
        }
    }

    pub fn set_name(&self, element: ScriptedElement, value: &str) {
        self.set_property(element, Property::Name, value);
    }

    /// Give `element` focus; every other element loses it
    pub fn set_focus(&self, element: ScriptedElement) {
        let mut tree = self.tree();
        for node in tree.nodes.iter_mut() {
            node.focused = false;
        }
        if let Some(node) = tree.nodes.get_mut(element.0) {
            node.focused = true;
        }
    }

    pub fn clear_focus(&self) {
        for node in self.tree().nodes.iter_mut() {
            node.focused = false;
        }
    }

    pub fn set_read_behavior(&self, element: ScriptedElement, behavior: ReadBehavior) {
        if let Some(node) = self.tree().nodes.get_mut(element.0) {
            node.behavior = behavior;
        }
    }

    /// Destroy an element and its subtree
    pub fn close(&self, element: ScriptedElement) {
        let mut tree = self.tree();
        tree.windows.retain(|&id| id != element.0);
        let parent = tree.nodes.get(element.0).and_then(|n| n.parent);
        if let Some(parent) = parent.and_then(|p| tree.nodes.get_mut(p)) {
            parent.children.retain(|&id| id != element.0);
        }

        let mut stack = vec![element.0];
        while let Some(id) = stack.pop() {
            if let Some(node) = tree.nodes.get_mut(id) {
                node.alive = false;
                stack.extend(node.children.iter().copied());
            }
        }
    }

    /// Number of property reads attempted so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Desktop for ScriptedDesktop {
    type Element = ScriptedElement;

    fn top_level_windows(&self) -> Vec<ScriptedElement> {
        self.tree().windows.iter().copied().map(ScriptedElement).collect()
    }

    fn children(&self, element: &ScriptedElement) -> Vec<ScriptedElement> {
        self.tree()
            .nodes
            .get(element.0)
            .filter(|n| n.alive)
            .map(|n| n.children.iter().copied().map(ScriptedElement).collect())
            .unwrap_or_default()
    }

    fn property(&self, element: &ScriptedElement, property: Property) -> Result<String, DesktopError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        // Lock is released before any scripted delay
        let (behavior, value) = {
            let tree = self.tree();
            let node = tree
                .nodes
                .get(element.0)
                .filter(|n| n.alive)
                .ok_or(DesktopError::ElementUnavailable)?;
            (node.behavior.clone(), node.props.get(&property).cloned())
        };

        match behavior {
            ReadBehavior::Normal => {}
            ReadBehavior::Fail => return Err(DesktopError::Backend("scripted failure".to_string())),
            ReadBehavior::Delay(delay) => std::thread::sleep(delay),
            ReadBehavior::Panic => panic!("scripted panic reading {:?}", property),
        }

        value.ok_or(DesktopError::PropertyUnavailable(property))
    }

    fn has_focus(&self, element: &ScriptedElement) -> bool {
        self.tree()
            .nodes
            .get(element.0)
            .map(|n| n.alive && n.focused)
            .unwrap_or(false)
    }

    fn is_alive(&self, element: &ScriptedElement) -> bool {
        self.tree().nodes.get(element.0).map(|n| n.alive).unwrap_or(false)
    }
}
