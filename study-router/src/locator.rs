//! Finding and caching elements of a reporting application's window.
//!
//! One `ElementLocator` exists per integration and is owned by that
//! integration's extractor, so its cache is only ever touched by the worker
//! thread. Every search runs as a bounded operation with a hard cap on the
//! number of nodes visited; hitting the cap counts as a miss for this cycle.

use crate::bounded::{Bounded, BoundedReader};
use crate::platform::{Desktop, Property};
use glob::{MatchOptions, Pattern, PatternError};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

const TITLE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Window title glob, matched case-insensitively
#[derive(Debug, Clone)]
pub struct TitlePattern {
    pattern: Pattern,
}

impl TitlePattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self {
            pattern: Pattern::new(pattern)?,
        })
    }

    pub fn matches(&self, title: &str) -> bool {
        self.pattern.matches_with(title, TITLE_MATCH)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

/// What identifies an element inside the window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementQuery {
    AutomationId(String),
}

impl ElementQuery {
    fn matches<D: Desktop>(&self, desktop: &D, element: &D::Element) -> bool {
        match self {
            ElementQuery::AutomationId(id) => desktop
                .property(element, Property::AutomationId)
                .map(|value| value == *id)
                .unwrap_or(false),
        }
    }
}

/// Node caps and deadline for tree searches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchLimits {
    /// Cap for descendant walks
    pub broad_cap: usize,
    /// Cap for walks over the direct children of a list
    pub narrow_cap: usize,
    pub timeout: Duration,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            broad_cap: 1000,
            narrow_cap: 50,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Element plus the text and focus read from it during a walk
#[derive(Debug, Clone, PartialEq)]
pub struct TextNode<E> {
    pub element: E,
    pub text: String,
    pub focused: bool,
}

enum Search<E> {
    Found(E),
    NotFound,
    CapReached,
}

fn breadth_first<D: Desktop>(desktop: &D, root: &D::Element, query: &ElementQuery, cap: usize) -> Search<D::Element> {
    let mut queue: VecDeque<D::Element> = desktop.children(root).into();
    let mut visited = 0;

    while let Some(element) = queue.pop_front() {
        visited += 1;
        if visited > cap {
            return Search::CapReached;
        }
        if query.matches(desktop, &element) {
            return Search::Found(element);
        }
        queue.extend(desktop.children(&element));
    }
    Search::NotFound
}

/// Document-order walk collecting every named node, or `None` past the cap
fn collect_text<D: Desktop>(desktop: &D, root: &D::Element, cap: usize) -> Option<Vec<TextNode<D::Element>>> {
    let mut stack: Vec<D::Element> = desktop.children(root);
    stack.reverse();
    let mut nodes = Vec::new();
    let mut visited = 0;

    while let Some(element) = stack.pop() {
        visited += 1;
        if visited > cap {
            return None;
        }
        let text = desktop.property(&element, Property::Name).unwrap_or_default();
        if !text.trim().is_empty() {
            nodes.push(TextNode {
                element: element.clone(),
                text,
                focused: desktop.has_focus(&element),
            });
        }
        let mut children = desktop.children(&element);
        children.reverse();
        stack.extend(children);
    }
    Some(nodes)
}

/// Locates one integration's window and the elements inside it
pub struct ElementLocator<D: Desktop> {
    reader: BoundedReader<D>,
    title: TitlePattern,
    limits: SearchLimits,
    window: Option<D::Element>,
    cache: HashMap<ElementQuery, D::Element>,
}

impl<D: Desktop> ElementLocator<D> {
    pub fn new(reader: BoundedReader<D>, title: TitlePattern, limits: SearchLimits) -> Self {
        Self {
            reader,
            title,
            limits,
            window: None,
            cache: HashMap::new(),
        }
    }

    pub fn reader(&self) -> &BoundedReader<D> {
        &self.reader
    }

    /// Number of cached element handles, the window excluded
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forget every cached handle
    pub fn invalidate(&mut self) {
        self.window = None;
        self.cache.clear();
    }

    /// The application window, if it currently exists.
    ///
    /// This is the cheap pre-check every extraction starts with: a cached
    /// window costs a single liveness probe.
    pub fn window(&mut self) -> Option<D::Element> {
        if let Some(window) = self.window.clone() {
            let probe = window.clone();
            let alive = self
                .reader
                .run(self.reader.timeout(), "window-alive", move |desktop| desktop.is_alive(&probe));
            if alive == Bounded::Completed(true) {
                return Some(window);
            }
            debug!("Window '{}' went away, dropping cached handles", self.title.as_str());
            self.invalidate();
        }

        let title = self.title.clone();
        let cap = self.limits.broad_cap;
        let scan = self.reader.run(self.limits.timeout, "window-scan", move |desktop| {
            desktop
                .top_level_windows()
                .into_iter()
                .take(cap)
                .find(|window| {
                    desktop
                        .property(window, Property::Name)
                        .map(|name| title.matches(&name))
                        .unwrap_or(false)
                })
        });

        match scan.completed().flatten() {
            Some(window) => {
                trace!("Found window matching '{}'", self.title.as_str());
                self.window = Some(window.clone());
                Some(window)
            }
            None => {
                debug!("No window matching '{}'", self.title.as_str());
                None
            }
        }
    }

    /// Element matching `query`, from cache or a bounded descendant search
    pub fn find(&mut self, query: &ElementQuery) -> Option<D::Element> {
        if let Some(element) = self.cache.get(query) {
            return Some(element.clone());
        }
        let window = self.window()?;

        let owned = query.clone();
        let cap = self.limits.broad_cap;
        let search = self.reader.run(self.limits.timeout, "find", move |desktop| {
            breadth_first(desktop, &window, &owned, cap)
        });

        match search {
            Bounded::Completed(Search::Found(element)) => {
                self.cache.insert(query.clone(), element.clone());
                Some(element)
            }
            Bounded::Completed(Search::CapReached) => {
                debug!("{:?}: gave up after {} nodes", query, cap);
                None
            }
            Bounded::Completed(Search::NotFound) => {
                debug!("{:?}: not found", query);
                None
            }
            other => {
                debug!("{:?}: search did not complete ({})", query, bounded_kind(&other));
                None
            }
        }
    }

    /// Read a property of the element matching `query`.
    ///
    /// Empty when the element is missing or the read fails; a failed read
    /// drops the cached handle so the next call searches again.
    pub fn read(&mut self, query: &ElementQuery, property: Property) -> String {
        let Some(element) = self.find(query) else {
            return String::new();
        };
        let outcome = self.reader.read(&element, property);
        if !outcome.is_ok() {
            self.cache.remove(query);
        }
        outcome.into_text()
    }

    /// Direct children of the list matching `query`, with their text.
    ///
    /// At most `narrow_cap` rows are visited; rows past the cap are left for
    /// the application to scroll into view.
    pub fn list_rows(&mut self, query: &ElementQuery) -> Option<Vec<TextNode<D::Element>>> {
        let list = self.find(query)?;
        let cap = self.limits.narrow_cap;
        let walk = self.reader.run(self.limits.timeout, "list-rows", move |desktop| {
            let children = desktop.children(&list);
            let total = children.len();
            let rows: Vec<_> = children
                .into_iter()
                .take(cap)
                .map(|row| {
                    let cells = desktop.children(&row);
                    let mut text = desktop.property(&row, Property::Name).unwrap_or_default();
                    // Grids that don't name their rows: join the cells
                    if text.trim().is_empty() {
                        text = cells
                            .iter()
                            .filter_map(|cell| desktop.property(cell, Property::Name).ok())
                            .collect::<Vec<_>>()
                            .join("\t");
                    }
                    let focused = desktop.has_focus(&row) || cells.iter().any(|cell| desktop.has_focus(cell));
                    TextNode {
                        element: row,
                        text,
                        focused,
                    }
                })
                .collect();
            (rows, total)
        });

        match walk {
            Bounded::Completed((rows, total)) => {
                if total > cap {
                    debug!("{:?}: {} rows, visited the first {}", query, total, cap);
                }
                Some(rows)
            }
            other => {
                debug!("{:?}: row walk did not complete ({})", query, bounded_kind(&other));
                self.cache.remove(query);
                None
            }
        }
    }

    /// Every named node of the window in document order.
    ///
    /// `None` when the window is missing, the walk passes `broad_cap`, or
    /// the walk does not finish in time.
    pub fn walk_text(&mut self) -> Option<Vec<TextNode<D::Element>>> {
        let window = self.window()?;
        let cap = self.limits.broad_cap;
        match self.reader.run(self.limits.timeout, "walk-text", move |desktop| {
            collect_text(desktop, &window, cap)
        }) {
            Bounded::Completed(Some(nodes)) => Some(nodes),
            Bounded::Completed(None) => {
                debug!("Text walk of '{}' gave up after {} nodes", self.title.as_str(), cap);
                None
            }
            other => {
                debug!("Text walk of '{}' did not complete ({})", self.title.as_str(), bounded_kind(&other));
                None
            }
        }
    }
}

fn bounded_kind<T>(result: &Bounded<T>) -> &'static str {
    match result {
        Bounded::Completed(_) => "completed",
        Bounded::TimedOut => "timed out",
        Bounded::Panicked => "panicked",
        Bounded::Rejected => "rejected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded::BoundedRunner;
    use crate::platform::{ReadBehavior, ScriptedDesktop};
    use std::sync::Arc;

    fn locator(desktop: &Arc<ScriptedDesktop>, title: &str, limits: SearchLimits) -> ElementLocator<ScriptedDesktop> {
        let reader = BoundedReader::new(Arc::clone(desktop), BoundedRunner::new(8), Duration::from_millis(200));
        ElementLocator::new(reader, TitlePattern::new(title).unwrap(), limits)
    }

    #[test]
    fn test_title_pattern_is_case_insensitive() {
        let pattern = TitlePattern::new("*powerscribe*").unwrap();
        assert!(pattern.matches("PowerScribe 360 | Reporting"));
        assert!(!pattern.matches("Mosaic Reporting"));
        assert!(TitlePattern::new("[").is_err());
    }

    #[test]
    fn test_window_missing() {
        let desktop = Arc::new(ScriptedDesktop::new());
        desktop.add_window("Notepad");
        let mut locator = locator(&desktop, "*PowerScribe*", SearchLimits::default());
        assert!(locator.window().is_none());
    }

    #[test]
    fn test_find_caches_handle() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("PowerScribe 360");
        let panel = desktop.add_child(window, "panel");
        let label = desktop.add_labeled(panel, "labelAccession", "ACC1001");
        let mut locator = locator(&desktop, "*PowerScribe*", SearchLimits::default());
        let query = ElementQuery::AutomationId("labelAccession".into());

        assert_eq!(locator.find(&query), Some(label));
        assert_eq!(locator.cached(), 1);

        let reads = desktop.read_count();
        assert_eq!(locator.find(&query), Some(label));
        assert_eq!(desktop.read_count(), reads, "cached lookup must not search");
    }

    #[test]
    fn test_failed_read_drops_cache_entry() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("PowerScribe 360");
        let label = desktop.add_labeled(window, "labelAccession", "ACC1001");
        let mut locator = locator(&desktop, "*PowerScribe*", SearchLimits::default());
        let query = ElementQuery::AutomationId("labelAccession".into());

        assert_eq!(locator.read(&query, Property::Name), "ACC1001");
        desktop.set_read_behavior(label, ReadBehavior::Delay(Duration::from_secs(5)));

        assert_eq!(locator.read(&query, Property::Name), "");
        assert_eq!(locator.cached(), 0);
    }

    #[test]
    fn test_closed_window_invalidates() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Clario - Worklist");
        desktop.add_labeled(window, "worklistGrid", "grid");
        let mut locator = locator(&desktop, "*clario*", SearchLimits::default());
        let query = ElementQuery::AutomationId("worklistGrid".into());
        assert!(locator.find(&query).is_some());

        desktop.close(window);
        assert!(locator.window().is_none());
        assert_eq!(locator.cached(), 0);

        let reopened = desktop.add_window("Clario - Worklist");
        let grid = desktop.add_labeled(reopened, "worklistGrid", "grid");
        assert_eq!(locator.find(&query), Some(grid));
    }

    #[test]
    fn test_search_cap_is_a_miss() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Mosaic");
        for i in 0..20 {
            desktop.add_child(window, &format!("filler {}", i));
        }
        desktop.add_labeled(window, "deep", "target");
        let limits = SearchLimits {
            broad_cap: 10,
            ..SearchLimits::default()
        };
        let mut locator = locator(&desktop, "mosaic*", limits);

        assert!(locator.find(&ElementQuery::AutomationId("deep".into())).is_none());
        assert_eq!(locator.cached(), 0);
    }

    #[test]
    fn test_list_rows_respects_narrow_cap() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Clario");
        let grid = desktop.add_labeled(window, "worklistGrid", "grid");
        for i in 0..8 {
            desktop.add_child(grid, &format!("ACC{}\tCT\thead", i));
        }
        let focused = desktop.add_child(grid, "ACC99\tCT\tchest");
        desktop.set_focus(focused);
        let limits = SearchLimits {
            narrow_cap: 5,
            ..SearchLimits::default()
        };
        let mut locator = locator(&desktop, "clario*", limits);

        let rows = locator.list_rows(&ElementQuery::AutomationId("worklistGrid".into())).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].text, "ACC0\tCT\thead");
        assert!(rows.iter().all(|row| !row.focused));
    }

    #[test]
    fn test_list_rows_joins_unnamed_cells() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Clario");
        let grid = desktop.add_labeled(window, "worklistGrid", "grid");
        let row = desktop.add_child(grid, "");
        desktop.add_child(row, "ACC7");
        let cell = desktop.add_child(row, "MRI brain");
        desktop.set_focus(cell);
        let mut locator = locator(&desktop, "clario*", SearchLimits::default());

        let rows = locator.list_rows(&ElementQuery::AutomationId("worklistGrid".into())).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "ACC7\tMRI brain");
        assert!(rows[0].focused);
    }

    #[test]
    fn test_walk_text_document_order() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Mosaic Reporting");
        let header = desktop.add_child(window, "Accession");
        desktop.add_child(header, "ACC1");
        let body = desktop.add_child(window, "");
        desktop.add_child(body, "Procedure");
        let mut locator = locator(&desktop, "mosaic*", SearchLimits::default());

        let texts: Vec<String> = locator.walk_text().unwrap().into_iter().map(|n| n.text).collect();
        assert_eq!(texts, vec!["Accession", "ACC1", "Procedure"]);
    }

    #[test]
    fn test_walk_text_cap() {
        let desktop = Arc::new(ScriptedDesktop::new());
        let window = desktop.add_window("Mosaic Reporting");
        for i in 0..30 {
            desktop.add_child(window, &format!("node {}", i));
        }
        let limits = SearchLimits {
            broad_cap: 25,
            ..SearchLimits::default()
        };
        let mut locator = locator(&desktop, "mosaic*", limits);
        assert!(locator.walk_text().is_none());
    }
}
