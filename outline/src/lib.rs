//! Outline structural editing library.
//!
//! Documents are trees of nested sections (a title plus a body that may hold
//! further sections). The heart of the crate is the level-change pipeline:
//! resolve a selection to its structural context, plan the edit as a pure
//! decision, apply it atomically to the tree, and restore a cursor.
//! A line-oriented text format (parser + formatter) gives tools and tests a
//! readable way to build and inspect outlines.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{HashMap, HashSet},
        fmt,
    };
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SectionId(pub Uuid);

    impl SectionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for SectionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockId(pub Uuid);

    impl BlockId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for BlockId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// A rich-text run used for titles and paragraphs.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RichText {
        #[serde(default)]
        pub inlines: Vec<Inline>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Inline {
        Text(String),
        Emphasis {
            kind: Emphasis,
            children: Vec<Inline>,
        },
        Code(String),
        Verbatim(String),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Emphasis {
        Bold,
        Italic,
        Underline,
        Strike,
    }

    impl Emphasis {
        pub fn delimiter(self) -> char {
            match self {
                Emphasis::Bold => '*',
                Emphasis::Italic => '/',
                Emphasis::Underline => '_',
                Emphasis::Strike => '+',
            }
        }
    }

    impl RichText {
        /// Unstyled text; an empty string yields an empty run.
        pub fn plain(text: &str) -> Self {
            if text.is_empty() {
                Self::default()
            } else {
                Self {
                    inlines: vec![Inline::Text(text.to_string())],
                }
            }
        }

        /// Render a plain text approximation, dropping markup.
        pub fn plain_text(&self) -> String {
            fn rec(xs: &[Inline], out: &mut String) {
                for x in xs {
                    match x {
                        Inline::Text(t) | Inline::Code(t) | Inline::Verbatim(t) => out.push_str(t),
                        Inline::Emphasis { children, .. } => rec(children, out),
                    }
                }
            }
            let mut s = String::new();
            rec(&self.inlines, &mut s);
            s
        }

        pub fn is_empty(&self) -> bool {
            self.inlines.is_empty() || self.plain_text().is_empty()
        }
    }

    /// Block-level content that can live in a section body.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Block {
        Paragraph(RichText),
        Quote(RichText),
        Code {
            language: Option<String>,
            code: String,
        },
        HorizontalRule,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ContentBlock {
        pub id: BlockId,
        pub block: Block,
    }

    impl ContentBlock {
        pub fn new(block: Block) -> Self {
            Self {
                id: BlockId::new(),
                block,
            }
        }

        pub fn paragraph(text: &str) -> Self {
            Self::new(Block::Paragraph(RichText::plain(text)))
        }

        /// The empty paragraph used to keep a section body non-empty.
        pub fn placeholder() -> Self {
            Self::new(Block::Paragraph(RichText::default()))
        }

        pub fn is_placeholder(&self) -> bool {
            matches!(&self.block, Block::Paragraph(text) if text.is_empty())
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A child of a section body (or of the document root).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Node {
        Block(ContentBlock),
        Section(SectionId),
    }

    impl Node {
        pub fn as_section(&self) -> Option<SectionId> {
            match self {
                Node::Section(id) => Some(*id),
                Node::Block(_) => None,
            }
        }
    }

    /// A heading with its body. The title is the section's first child by
    /// construction, so it cannot be duplicated or reordered.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub id: SectionId,
        /// 1 is outermost; bounded by `OutlineConfig::max_level`.
        pub level: u8,
        pub title: RichText,
        #[serde(default)]
        pub body: Vec<Node>,
    }

    impl Section {
        pub fn new(level: u8, title: RichText) -> Self {
            Self {
                id: SectionId::new(),
                level,
                title,
                body: vec![],
            }
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the document. `body` is the implicit level-0 container
    /// and `sections` owns every section node in the tree.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Outline {
        #[serde(default)]
        pub body: Vec<Node>,
        #[serde(default)]
        pub sections: IndexMap<SectionId, Section>,
    }

    impl Outline {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn section(&self, id: SectionId) -> Option<&Section> {
            self.sections.get(&id)
        }

        pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
            self.sections.get_mut(&id)
        }

        pub fn body(&self, container: Container) -> Option<&[Node]> {
            match container {
                Container::Root => Some(&self.body),
                Container::Section(id) => self.sections.get(&id).map(|s| s.body.as_slice()),
            }
        }

        pub fn body_mut(&mut self, container: Container) -> Option<&mut Vec<Node>> {
            match container {
                Container::Root => Some(&mut self.body),
                Container::Section(id) => self.sections.get_mut(&id).map(|s| &mut s.body),
            }
        }

        /// Level of a container; the root counts as level 0.
        pub fn level_of(&self, container: Container) -> Option<u8> {
            match container {
                Container::Root => Some(0),
                Container::Section(id) => self.sections.get(&id).map(|s| s.level),
            }
        }

        /// Register a section in the arena without placing it in the tree.
        pub fn insert_section(&mut self, section: Section) -> SectionId {
            let id = section.id;
            self.sections.insert(id, section);
            id
        }

        /// Append `section` to the body of `container`.
        pub fn push_section(&mut self, container: Container, section: Section) -> Option<SectionId> {
            let id = section.id;
            self.body_mut(container)?.push(Node::Section(id));
            self.sections.insert(id, section);
            Some(id)
        }

        /// Container and body index of every section referenced from the tree.
        pub fn parent_map(&self) -> HashMap<SectionId, (Container, usize)> {
            let mut out = HashMap::with_capacity(self.sections.len());
            let mut record = |owner: Container, body: &[Node]| {
                for (idx, node) in body.iter().enumerate() {
                    if let Node::Section(id) = node {
                        out.insert(*id, (owner, idx));
                    }
                }
            };
            record(Container::Root, &self.body);
            for section in self.sections.values() {
                record(Container::Section(section.id), &section.body);
            }
            out
        }

        pub fn parent_of(&self, id: SectionId) -> Option<(Container, usize)> {
            self.parent_map().get(&id).copied()
        }

        /// Enclosing sections from the root down to `container` (inclusive).
        /// `None` when the container is not reachable from the root.
        pub fn ancestors(&self, container: Container) -> Option<Vec<SectionId>> {
            let parents = self.parent_map();
            let mut chain = Vec::new();
            let mut cursor = container;
            while let Container::Section(id) = cursor {
                if chain.len() > self.sections.len() || !self.sections.contains_key(&id) {
                    return None;
                }
                chain.push(id);
                cursor = parents.get(&id)?.0;
            }
            chain.reverse();
            Some(chain)
        }

        /// The document's first section; its title is protected.
        pub fn first_section(&self) -> Option<SectionId> {
            self.body.iter().find_map(Node::as_section)
        }

        /// Every content block in document order.
        pub fn leaf_blocks(&self) -> Vec<&ContentBlock> {
            fn rec<'a>(outline: &'a Outline, body: &'a [Node], out: &mut Vec<&'a ContentBlock>) {
                for node in body {
                    match node {
                        Node::Block(block) => out.push(block),
                        Node::Section(id) => {
                            if let Some(section) = outline.sections.get(id) {
                                rec(outline, &section.body, out);
                            }
                        }
                    }
                }
            }
            let mut out = Vec::new();
            rec(self, &self.body, &mut out);
            out
        }

        /// Section ids in document (pre-)order.
        pub fn sections_in_order(&self) -> Vec<SectionId> {
            fn rec(outline: &Outline, body: &[Node], out: &mut Vec<SectionId>) {
                for id in body.iter().filter_map(Node::as_section) {
                    out.push(id);
                    if let Some(section) = outline.sections.get(&id) {
                        rec(outline, &section.body, out);
                    }
                }
            }
            let mut out = Vec::new();
            rec(self, &self.body, &mut out);
            out
        }

        /// Check every invariant over the whole document, including arena
        /// consistency (no orphaned sections).
        pub fn validate(&self, max_level: u8) -> Result<(), Violation> {
            let seen = self.check_subtree(Container::Root, max_level)?;
            if let Some(orphan) = self.sections.keys().find(|id| !seen.contains(*id)) {
                return Err(Violation::Orphan(*orphan));
            }
            Ok(())
        }

        /// Check the invariants of `container` and everything below it.
        pub fn validate_subtree(&self, container: Container, max_level: u8) -> Result<(), Violation> {
            self.check_subtree(container, max_level).map(|_| ())
        }

        fn check_subtree(
            &self,
            container: Container,
            max_level: u8,
        ) -> Result<HashSet<SectionId>, Violation> {
            let mut seen_sections = HashSet::new();
            let mut seen_blocks = HashSet::new();
            let (level, body) = match container {
                Container::Root => (0, self.body.as_slice()),
                Container::Section(id) => {
                    let section = self.sections.get(&id).ok_or(Violation::MissingSection(id))?;
                    check_section(section, max_level)?;
                    seen_sections.insert(id);
                    (section.level, section.body.as_slice())
                }
            };
            self.check_body(level, body, max_level, &mut seen_sections, &mut seen_blocks)?;
            Ok(seen_sections)
        }

        fn check_body(
            &self,
            owner_level: u8,
            body: &[Node],
            max_level: u8,
            seen_sections: &mut HashSet<SectionId>,
            seen_blocks: &mut HashSet<BlockId>,
        ) -> Result<(), Violation> {
            for node in body {
                match node {
                    Node::Block(block) => {
                        if !seen_blocks.insert(block.id) {
                            return Err(Violation::DuplicateBlock(block.id));
                        }
                    }
                    Node::Section(id) => {
                        if !seen_sections.insert(*id) {
                            return Err(Violation::SharedSection(*id));
                        }
                        let child = self.sections.get(id).ok_or(Violation::MissingSection(*id))?;
                        check_section(child, max_level)?;
                        if child.level <= owner_level {
                            return Err(Violation::NotNested {
                                section: *id,
                                level: child.level,
                                parent_level: owner_level,
                            });
                        }
                        self.check_body(child.level, &child.body, max_level, seen_sections, seen_blocks)?;
                    }
                }
            }
            Ok(())
        }
    }

    fn check_section(section: &Section, max_level: u8) -> Result<(), Violation> {
        if section.level == 0 || section.level > max_level {
            return Err(Violation::LevelOutOfRange {
                section: section.id,
                level: section.level,
                max: max_level,
            });
        }
        if section.body.is_empty() {
            return Err(Violation::EmptyBody(section.id));
        }
        Ok(())
    }

    /* ----------------------------- Addressing ----------------------------- */

    /// A body owner: the document root or a section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Container {
        Root,
        Section(SectionId),
    }

    /// A cursor location expressed as section id plus child index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Position {
        /// Inside a section title; `offset` is a character offset.
        Title { section: SectionId, offset: usize },
        /// Inside the `index`-th child of a container body.
        Body {
            container: Container,
            index: usize,
            offset: usize,
        },
    }

    impl Position {
        pub fn title(section: SectionId) -> Self {
            Position::Title { section, offset: 0 }
        }

        pub fn body(container: Container, index: usize) -> Self {
            Position::Body {
                container,
                index,
                offset: 0,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Selection {
        pub anchor: Position,
        pub head: Position,
    }

    impl Selection {
        pub fn new(anchor: Position, head: Position) -> Self {
            Self { anchor, head }
        }

        pub fn collapsed(at: Position) -> Self {
            Self { anchor: at, head: at }
        }

        pub fn is_collapsed(&self) -> bool {
            self.anchor == self.head
        }
    }

    /// Half-open range of child indices in one container body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockRange {
        pub start: usize,
        pub end: usize,
    }

    impl BlockRange {
        pub fn contains(&self, index: usize) -> bool {
            self.start <= index && index < self.end
        }

        pub fn len(&self) -> usize {
            self.end.saturating_sub(self.start)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// A broken tree invariant.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
    pub enum Violation {
        #[error("section {section} has level {level}, outside 1..={max}")]
        LevelOutOfRange { section: SectionId, level: u8, max: u8 },
        #[error("section {section} (level {level}) is not deeper than its parent (level {parent_level})")]
        NotNested {
            section: SectionId,
            level: u8,
            parent_level: u8,
        },
        #[error("section {0} has an empty body")]
        EmptyBody(SectionId),
        #[error("section {0} is referenced but missing")]
        MissingSection(SectionId),
        #[error("section {0} is referenced more than once")]
        SharedSection(SectionId),
        #[error("section {0} is not reachable from the document root")]
        Orphan(SectionId),
        #[error("block {0} appears more than once")]
        DuplicateBlock(BlockId),
    }

    /// Why a level change was not applied. The tree is always left unchanged.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
    pub enum Rejection {
        #[error("the document title is protected")]
        ProtectedTitle,
        #[error("selection has no resolvable structural context")]
        NoResolvableContext,
        #[error("edit would break the outline: {0}")]
        InvariantViolation(#[from] Violation),
        #[error("level {0} is outside the supported range")]
        InvalidLevel(u8),
    }

    impl Rejection {
        pub fn reason(&self) -> &'static str {
            match self {
                Rejection::ProtectedTitle => "protected-title",
                Rejection::NoResolvableContext => "no-resolvable-context",
                Rejection::InvariantViolation(_) => "invariant-violation",
                Rejection::InvalidLevel(_) => "invalid-level",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn nested() -> (Outline, SectionId, SectionId) {
            let mut outline = Outline::new();
            let mut top = Section::new(1, RichText::plain("Top"));
            top.body.push(Node::Block(ContentBlock::paragraph("intro")));
            let top_id = outline.push_section(Container::Root, top).unwrap();
            let mut child = Section::new(3, RichText::plain("Deep"));
            child.body.push(Node::Block(ContentBlock::paragraph("x")));
            let child_id = outline
                .push_section(Container::Section(top_id), child)
                .unwrap();
            (outline, top_id, child_id)
        }

        #[test]
        fn ancestors_walk_from_root() {
            let (outline, top, child) = nested();
            assert_eq!(
                outline.ancestors(Container::Section(child)),
                Some(vec![top, child])
            );
            assert_eq!(outline.ancestors(Container::Root), Some(vec![]));
            assert_eq!(outline.parent_of(child), Some((Container::Section(top), 1)));
            assert_eq!(outline.first_section(), Some(top));
        }

        #[test]
        fn unreachable_container_has_no_ancestors() {
            let (mut outline, _, _) = nested();
            let loose = outline.insert_section(Section::new(2, RichText::plain("loose")));
            assert_eq!(outline.ancestors(Container::Section(loose)), None);
            assert_eq!(outline.validate(9), Err(Violation::Orphan(loose)));
        }

        #[test]
        fn validate_accepts_well_nested_tree() {
            let (outline, _, _) = nested();
            assert_eq!(outline.validate(9), Ok(()));
            let texts: Vec<String> = outline
                .leaf_blocks()
                .iter()
                .map(|b| match &b.block {
                    Block::Paragraph(t) => t.plain_text(),
                    _ => String::new(),
                })
                .collect();
            assert_eq!(texts, vec!["intro", "x"]);
        }

        #[test]
        fn validate_reports_nesting_and_level_errors() {
            let (mut outline, top, child) = nested();
            outline.section_mut(child).unwrap().level = 1;
            assert_eq!(
                outline.validate(9),
                Err(Violation::NotNested {
                    section: child,
                    level: 1,
                    parent_level: 1
                })
            );

            outline.section_mut(child).unwrap().level = 4;
            assert!(matches!(
                outline.validate(3),
                Err(Violation::LevelOutOfRange { level: 4, max: 3, .. })
            ));

            outline.section_mut(top).unwrap().body.clear();
            assert_eq!(outline.validate(9), Err(Violation::EmptyBody(top)));
        }

        #[test]
        fn shared_section_is_detected() {
            let (mut outline, _, child) = nested();
            outline.body.push(Node::Section(child));
            assert!(matches!(
                outline.validate(9),
                Err(Violation::SharedSection(id)) if id == child
            ));
        }

        #[test]
        fn placeholder_is_an_empty_paragraph() {
            assert!(ContentBlock::placeholder().is_placeholder());
            assert!(!ContentBlock::paragraph("text").is_placeholder());
            assert!(!ContentBlock::new(Block::HorizontalRule).is_placeholder());
        }
    }
}

pub mod config {
    //! Session configuration. It is passed explicitly into every entry point;
    //! nothing in the crate reads process-wide state.

    use anyhow::{Context, Result, bail};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    pub const DEFAULT_MAX_LEVEL: u8 = 9;

    /// What an ascend leaves behind in the section it pulled content out of.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum PlaceholderPolicy {
        /// Always insert an empty paragraph at the vacated position.
        #[default]
        Always,
        /// Only when the whole body was pulled out.
        WhenVacated,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OutlineConfig {
        /// Deepest allowed section level (levels run from 1).
        #[serde(default = "OutlineConfig::default_max_level")]
        pub max_level: u8,

        #[serde(default)]
        pub ascend_placeholder: PlaceholderPolicy,
    }

    impl Default for OutlineConfig {
        fn default() -> Self {
            Self {
                max_level: DEFAULT_MAX_LEVEL,
                ascend_placeholder: PlaceholderPolicy::default(),
            }
        }
    }

    impl OutlineConfig {
        fn default_max_level() -> u8 {
            DEFAULT_MAX_LEVEL
        }

        /// Load a JSON config file; missing keys fall back to defaults.
        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let config: Self = serde_json::from_str(&text)
                .with_context(|| format!("parsing config {:?}", path))?;
            if config.max_level == 0 {
                bail!("max_level must be at least 1 in {:?}", path);
            }
            Ok(config)
        }

        pub fn accepts_level(&self, level: u8) -> bool {
            (1..=self.max_level).contains(&level)
        }
    }

}

pub mod resolver {
    //! Maps a raw selection onto structural coordinates: the chain of
    //! enclosing sections and a whole-node range in the innermost container.

    use crate::core::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tracing::trace;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StructuralContext {
        /// Enclosing sections, root first.
        pub path: Vec<SectionId>,
        /// Body that directly holds `block_range`.
        pub container: Container,
        /// Level of `container`; 0 at the document root.
        pub parent_level: u8,
        pub block_range: BlockRange,
        /// Set when the whole selection sits in one section title. The
        /// context is then that section's parent and the range covers it.
        pub heading: Option<SectionId>,
    }

    impl StructuralContext {
        pub fn innermost(&self) -> Option<SectionId> {
            self.path.last().copied()
        }
    }

    /// A child index inside a container body.
    type Step = (Container, usize);

    pub fn resolve(outline: &Outline, selection: &Selection) -> Result<StructuralContext, Rejection> {
        let parents = outline.parent_map();

        if let (
            Position::Title { section: a, .. },
            Position::Title { section: b, .. },
        ) = (selection.anchor, selection.head)
        {
            if a == b {
                let (container, index) = *parents.get(&a).ok_or(Rejection::NoResolvableContext)?;
                let range = BlockRange {
                    start: index,
                    end: index + 1,
                };
                return context(outline, container, range, Some(a));
            }
        }

        let anchor = address(outline, &parents, selection.anchor)?;
        let head = address(outline, &parents, selection.head)?;
        let (container, range) =
            common_range(&anchor, &head).ok_or(Rejection::NoResolvableContext)?;
        context(outline, container, range, None)
    }

    /// Steps from the root down to the node holding `position`. A title
    /// position stops at the section node itself.
    fn address(
        outline: &Outline,
        parents: &HashMap<SectionId, (Container, usize)>,
        position: Position,
    ) -> Result<Vec<Step>, Rejection> {
        let leaf = match position {
            Position::Title { section, .. } => {
                if outline.section(section).is_none() {
                    return Err(Rejection::NoResolvableContext);
                }
                *parents.get(&section).ok_or(Rejection::NoResolvableContext)?
            }
            Position::Body {
                container, index, ..
            } => {
                let body = outline
                    .body(container)
                    .ok_or(Rejection::NoResolvableContext)?;
                if index >= body.len() {
                    return Err(Rejection::NoResolvableContext);
                }
                (container, index)
            }
        };

        let mut steps = vec![leaf];
        let mut cursor = leaf.0;
        while let Container::Section(id) = cursor {
            if steps.len() > outline.sections.len() {
                return Err(Rejection::NoResolvableContext);
            }
            let parent = *parents.get(&id).ok_or(Rejection::NoResolvableContext)?;
            steps.push(parent);
            cursor = parent.0;
        }
        steps.reverse();
        Ok(steps)
    }

    /// Deepest container both addresses pass through, with the range of its
    /// children spanning them.
    fn common_range(a: &[Step], b: &[Step]) -> Option<(Container, BlockRange)> {
        let mut depth = 0;
        loop {
            let (container_a, index_a) = *a.get(depth)?;
            let (container_b, index_b) = *b.get(depth)?;
            if container_a != container_b {
                return None;
            }
            if index_a == index_b && depth + 1 < a.len() && depth + 1 < b.len() {
                depth += 1;
                continue;
            }
            let range = BlockRange {
                start: index_a.min(index_b),
                end: index_a.max(index_b) + 1,
            };
            return Some((container_a, range));
        }
    }

    fn context(
        outline: &Outline,
        container: Container,
        block_range: BlockRange,
        heading: Option<SectionId>,
    ) -> Result<StructuralContext, Rejection> {
        let path = outline
            .ancestors(container)
            .ok_or(Rejection::NoResolvableContext)?;
        let parent_level = outline
            .level_of(container)
            .ok_or(Rejection::NoResolvableContext)?;
        trace!(
            ?container,
            start = block_range.start,
            end = block_range.end,
            parent_level,
            heading = heading.is_some(),
            "resolved selection"
        );
        Ok(StructuralContext {
            path,
            container,
            parent_level,
            block_range,
            heading,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::testing::{block_at, fixture, section_titled};

        #[test]
        fn collapsed_cursor_in_section_body() {
            let outline = fixture("* Title\nParaA\nParaB\n");
            let title = section_titled(&outline, "Title");
            let ctx = resolve(&outline, &Selection::collapsed(block_at(&outline, "ParaB"))).unwrap();
            assert_eq!(ctx.path, vec![title]);
            assert_eq!(ctx.container, Container::Section(title));
            assert_eq!(ctx.parent_level, 1);
            assert_eq!(ctx.block_range, BlockRange { start: 1, end: 2 });
            assert_eq!(ctx.heading, None);
        }

        #[test]
        fn root_blocks_resolve_to_level_zero() {
            let outline = fixture("preamble\n* Title\nbody\n");
            let ctx =
                resolve(&outline, &Selection::collapsed(block_at(&outline, "preamble"))).unwrap();
            assert_eq!(ctx.container, Container::Root);
            assert_eq!(ctx.parent_level, 0);
            assert!(ctx.path.is_empty());
        }

        #[test]
        fn title_selection_points_at_the_section_node() {
            let outline = fixture("* Title\nintro\n** Child\ntext\n");
            let title = section_titled(&outline, "Title");
            let child = section_titled(&outline, "Child");
            let ctx = resolve(&outline, &Selection::collapsed(Position::title(child))).unwrap();
            assert_eq!(ctx.heading, Some(child));
            assert_eq!(ctx.container, Container::Section(title));
            assert_eq!(ctx.block_range, BlockRange { start: 1, end: 2 });
        }

        #[test]
        fn endpoints_in_different_containers_lift_to_common_ancestor() {
            let outline = fixture("* Title\nParaA\n** Child\ndeep\nParaB\n");
            let title = section_titled(&outline, "Title");
            let selection = Selection::new(block_at(&outline, "ParaA"), block_at(&outline, "deep"));
            let ctx = resolve(&outline, &selection).unwrap();
            assert_eq!(ctx.container, Container::Section(title));
            assert_eq!(ctx.block_range, BlockRange { start: 0, end: 2 });

            let reversed = Selection::new(selection.head, selection.anchor);
            assert_eq!(resolve(&outline, &reversed).unwrap(), ctx);
        }

        #[test]
        fn out_of_range_positions_are_unresolvable() {
            let outline = fixture("* Title\nParaA\n");
            let title = section_titled(&outline, "Title");
            let bad = Selection::collapsed(Position::body(Container::Section(title), 5));
            assert_eq!(resolve(&outline, &bad), Err(Rejection::NoResolvableContext));

            let missing = Selection::collapsed(Position::title(SectionId::new()));
            assert_eq!(resolve(&outline, &missing), Err(Rejection::NoResolvableContext));
        }
    }
}

pub mod planner {
    //! Level transition planning. Pure: the same context, request and tree
    //! always yield the same plan, and nothing is mutated.
    //!
    //! | request vs parent level | op                | capture                                   |
    //! |-------------------------|-------------------|-------------------------------------------|
    //! | equal                   | `Merge`           | cursor .. end of the enclosing section    |
    //! | greater                 | `Descend(case)`   | cursor .. first section at level <= request |
    //! | less                    | `Ascend`          | cursor .. end of the chain below the target |

    use crate::config::{OutlineConfig, PlaceholderPolicy};
    use crate::core::*;
    use crate::resolver::StructuralContext;
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use tracing::debug;

    /// Title and identity of a heading being re-leveled.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CarriedHeading {
        pub id: SectionId,
        pub title: RichText,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LevelRequest {
        pub level: u8,
        pub carry: Option<CarriedHeading>,
    }

    impl LevelRequest {
        pub fn new(level: u8) -> Self {
            Self { level, carry: None }
        }

        pub fn carrying(level: u8, heading: CarriedHeading) -> Self {
            Self {
                level,
                carry: Some(heading),
            }
        }
    }

    /// How the descend boundary was found.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DescendCase {
        /// No nested section after the cursor.
        Simple,
        /// The next section already sits at the requested level.
        SameLevelSibling,
        /// The next section is shallower than requested.
        ShallowerSibling,
        /// The next section is deeper and gets absorbed, up to the first
        /// section at or above the requested level.
        ChainBreak,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PlanOp {
        Merge,
        Descend(DescendCase),
        Ascend,
    }

    /// Children `[start, end)` of one container body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Span {
        pub container: Container,
        pub start: usize,
        pub end: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InsertPoint {
        pub container: Container,
        pub index: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EditPlan {
        pub op: PlanOp,
        /// Spans in document order, each in a distinct container. The new
        /// section's body is their concatenation.
        pub capture: Vec<Span>,
        /// Counted after the captured spans are removed.
        pub insert_at: InsertPoint,
        pub new_level: u8,
        pub title: RichText,
        pub reuse_id: Option<SectionId>,
        /// Empty paragraph left at the vacated position (ascend only).
        pub placeholder: Option<InsertPoint>,
    }

    impl EditPlan {
        pub fn capture_start(&self) -> Option<Position> {
            self.capture
                .first()
                .map(|span| Position::body(span.container, span.start))
        }

        pub fn capture_end(&self) -> Option<Position> {
            self.capture
                .last()
                .map(|span| Position::body(span.container, span.end))
        }

        pub fn captured_len(&self) -> usize {
            self.capture
                .iter()
                .map(|span| span.end.saturating_sub(span.start))
                .sum()
        }
    }

    /// Reject any context that touches the first section of the document.
    pub fn guard(ctx: &StructuralContext, outline: &Outline) -> Result<(), Rejection> {
        let Some(protected) = outline.first_section() else {
            return Ok(());
        };
        if ctx.heading == Some(protected) {
            return Err(Rejection::ProtectedTitle);
        }
        if ctx.container == Container::Root {
            let index = outline
                .body
                .iter()
                .position(|node| node.as_section() == Some(protected));
            if index.is_some_and(|i| ctx.block_range.contains(i)) {
                return Err(Rejection::ProtectedTitle);
            }
        }
        Ok(())
    }

    pub fn plan(
        ctx: &StructuralContext,
        request: &LevelRequest,
        outline: &Outline,
        config: &OutlineConfig,
    ) -> Result<EditPlan, Rejection> {
        guard(ctx, outline)?;
        if !config.accepts_level(request.level) {
            return Err(Rejection::InvalidLevel(request.level));
        }
        let body = outline
            .body(ctx.container)
            .ok_or(Rejection::NoResolvableContext)?;
        if ctx.block_range.is_empty() || ctx.block_range.end > body.len() {
            return Err(Rejection::NoResolvableContext);
        }

        let plan = match request.level.cmp(&ctx.parent_level) {
            Ordering::Equal => plan_merge(ctx, request, outline, body.len())?,
            Ordering::Greater => plan_descend(ctx, request, outline, body)?,
            Ordering::Less => plan_ascend(ctx, request, outline, config, body.len())?,
        };
        guard_insertion(&plan, outline)?;
        debug!(
            op = ?plan.op,
            new_level = plan.new_level,
            captured = plan.captured_len(),
            relevel = plan.reuse_id.is_some(),
            "planned level change"
        );
        Ok(plan)
    }

    /// A new root-level section must not land in front of the protected
    /// section, or it would take over the protection.
    fn guard_insertion(plan: &EditPlan, outline: &Outline) -> Result<(), Rejection> {
        if plan.insert_at.container != Container::Root {
            return Ok(());
        }
        let Some(protected) = outline.body.iter().position(|node| node.as_section().is_some())
        else {
            return Ok(());
        };
        // `insert_at` is in post-removal coordinates.
        let removed: usize = plan
            .capture
            .iter()
            .filter(|span| span.container == Container::Root)
            .map(|span| span.end.min(protected).saturating_sub(span.start))
            .sum();
        if plan.insert_at.index <= protected - removed {
            return Err(Rejection::ProtectedTitle);
        }
        Ok(())
    }

    fn new_plan(
        op: PlanOp,
        capture: Vec<Span>,
        insert_at: InsertPoint,
        request: &LevelRequest,
    ) -> EditPlan {
        let (title, reuse_id) = match &request.carry {
            Some(heading) => (heading.title.clone(), Some(heading.id)),
            None => (RichText::default(), None),
        };
        EditPlan {
            op,
            capture,
            insert_at,
            new_level: request.level,
            title,
            reuse_id,
            placeholder: None,
        }
    }

    /// The cursor content splits off into a new sibling after the
    /// enclosing section.
    fn plan_merge(
        ctx: &StructuralContext,
        request: &LevelRequest,
        outline: &Outline,
        body_len: usize,
    ) -> Result<EditPlan, Rejection> {
        let Container::Section(current) = ctx.container else {
            return Err(Rejection::NoResolvableContext);
        };
        let (parent, index) = outline
            .parent_of(current)
            .ok_or(Rejection::NoResolvableContext)?;
        let capture = vec![Span {
            container: ctx.container,
            start: ctx.block_range.start,
            end: body_len,
        }];
        let insert_at = InsertPoint {
            container: parent,
            index: index + 1,
        };
        Ok(new_plan(PlanOp::Merge, capture, insert_at, request))
    }

    /// The new section becomes a child of the current container, at the
    /// cursor.
    fn plan_descend(
        ctx: &StructuralContext,
        request: &LevelRequest,
        outline: &Outline,
        body: &[Node],
    ) -> Result<EditPlan, Rejection> {
        let levels = body
            .iter()
            .map(|node| match node {
                Node::Block(_) => Ok(None),
                Node::Section(id) => outline
                    .section(*id)
                    .map(|s| Some(s.level))
                    .ok_or(Rejection::InvariantViolation(Violation::MissingSection(*id))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let start = ctx.block_range.start;
        let closest = (start..body.len()).find_map(|i| levels[i].map(|level| (i, level)));
        let (case, boundary) = match closest {
            None => (DescendCase::Simple, body.len()),
            Some((i, level)) => match level.cmp(&request.level) {
                Ordering::Equal => (DescendCase::SameLevelSibling, i),
                Ordering::Less => (DescendCase::ShallowerSibling, i),
                Ordering::Greater => {
                    let stop = (i + 1..body.len())
                        .find(|&j| levels[j].is_some_and(|level| level <= request.level))
                        .unwrap_or(body.len());
                    (DescendCase::ChainBreak, stop)
                }
            },
        };

        // Nothing to wrap. A carried heading may still come back with a
        // placeholder body.
        if boundary == start && request.carry.is_none() {
            return Err(Rejection::NoResolvableContext);
        }
        let capture = vec![Span {
            container: ctx.container,
            start,
            end: boundary,
        }];
        let insert_at = InsertPoint {
            container: ctx.container,
            index: start,
        };
        Ok(new_plan(PlanOp::Descend(case), capture, insert_at, request))
    }

    /// Climb to the innermost ancestor shallower than the request and
    /// re-wrap everything dangling below the cursor as its child.
    fn plan_ascend(
        ctx: &StructuralContext,
        request: &LevelRequest,
        outline: &Outline,
        config: &OutlineConfig,
        body_len: usize,
    ) -> Result<EditPlan, Rejection> {
        if ctx.innermost().map(Container::Section) != Some(ctx.container) {
            return Err(Rejection::NoResolvableContext);
        }
        let level_of = |id: &SectionId| outline.section(*id).map_or(0, |s| s.level);

        let (target, branch_depth) = match ctx.path.iter().rposition(|id| level_of(id) < request.level)
        {
            Some(depth) => (Container::Section(ctx.path[depth]), depth + 1),
            None => (Container::Root, 0),
        };
        let branch = *ctx
            .path
            .get(branch_depth)
            .ok_or(Rejection::NoResolvableContext)?;

        let parents = outline.parent_map();
        let start = ctx.block_range.start;
        let mut capture = vec![Span {
            container: ctx.container,
            start,
            end: body_len,
        }];
        // Tails of the intermediate ancestors, innermost first.
        for depth in (branch_depth..ctx.path.len() - 1).rev() {
            let owner = ctx.path[depth];
            let child = ctx.path[depth + 1];
            let (_, index) = *parents
                .get(&child)
                .ok_or(Rejection::NoResolvableContext)?;
            let owner_len = outline
                .section(owner)
                .map(|s| s.body.len())
                .ok_or(Rejection::NoResolvableContext)?;
            if index + 1 < owner_len {
                capture.push(Span {
                    container: Container::Section(owner),
                    start: index + 1,
                    end: owner_len,
                });
            }
        }

        let (_, branch_index) = *parents
            .get(&branch)
            .ok_or(Rejection::NoResolvableContext)?;
        let insert_at = InsertPoint {
            container: target,
            index: branch_index + 1,
        };

        let mut plan = new_plan(PlanOp::Ascend, capture, insert_at, request);
        let leave_placeholder = match config.ascend_placeholder {
            PlaceholderPolicy::Always => request.carry.is_none(),
            PlaceholderPolicy::WhenVacated => start == 0,
        };
        if leave_placeholder {
            plan.placeholder = Some(InsertPoint {
                container: ctx.container,
                index: start,
            });
        }
        Ok(plan)
    }

}

pub mod mutator {
    //! Applies an `EditPlan`. Every mutation runs on a private copy of the
    //! tree and is only returned once the touched subtree validates, so a
    //! rejected plan never leaves a half-edited document behind.

    use crate::config::OutlineConfig;
    use crate::core::*;
    use crate::planner::{CarriedHeading, EditPlan, InsertPoint};
    use tracing::debug;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Applied {
        pub outline: Outline,
        /// The newly leveled section.
        pub section: SectionId,
    }

    pub fn apply(
        plan: &EditPlan,
        outline: &Outline,
        config: &OutlineConfig,
    ) -> Result<Applied, Rejection> {
        let mut work = outline.clone();

        let mut fragment = Vec::with_capacity(plan.captured_len());
        for span in &plan.capture {
            let body = work
                .body_mut(span.container)
                .ok_or(Rejection::NoResolvableContext)?;
            if span.start > span.end || span.end > body.len() {
                return Err(Rejection::NoResolvableContext);
            }
            fragment.extend(body.drain(span.start..span.end));
        }

        if let Some(at) = plan.placeholder {
            insert_node(&mut work, at, Node::Block(ContentBlock::placeholder()))?;
        }

        let mut section = Section::new(plan.new_level, plan.title.clone());
        if let Some(id) = plan.reuse_id {
            if work.sections.contains_key(&id) {
                return Err(Violation::SharedSection(id).into());
            }
            section.id = id;
        }
        section.body = fragment;
        let id = work.insert_section(section);
        insert_node(&mut work, plan.insert_at, Node::Section(id))?;

        let touched = plan
            .capture
            .iter()
            .map(|span| span.container)
            .chain([Container::Section(id)]);
        for container in touched {
            if let Container::Section(_) = container {
                if let Some(body) = work.body_mut(container) {
                    if body.is_empty() {
                        body.push(Node::Block(ContentBlock::placeholder()));
                    }
                }
            }
        }

        work.validate_subtree(plan.insert_at.container, config.max_level)?;
        debug!(
            section = %id,
            level = plan.new_level,
            moved = plan.captured_len(),
            "applied level change"
        );
        Ok(Applied { outline: work, section: id })
    }

    fn insert_node(outline: &mut Outline, at: InsertPoint, node: Node) -> Result<(), Rejection> {
        let body = outline
            .body_mut(at.container)
            .ok_or(Rejection::NoResolvableContext)?;
        if at.index > body.len() {
            return Err(Rejection::NoResolvableContext);
        }
        body.insert(at.index, node);
        Ok(())
    }

    /// Lift a section's body into its parent in place of the section and
    /// drop the section from the arena. Returns the parent, the range the
    /// lifted children now occupy, and the heading to carry over.
    pub fn unwrap_heading(
        outline: &mut Outline,
        id: SectionId,
    ) -> Result<(Container, BlockRange, CarriedHeading), Rejection> {
        let (parent, index) = outline
            .parent_of(id)
            .ok_or(Rejection::NoResolvableContext)?;
        let section = outline
            .sections
            .shift_remove(&id)
            .ok_or(Rejection::NoResolvableContext)?;
        let lifted = if section.body.is_empty() {
            vec![Node::Block(ContentBlock::placeholder())]
        } else {
            section.body
        };
        let range = BlockRange {
            start: index,
            end: index + lifted.len(),
        };
        let body = outline
            .body_mut(parent)
            .ok_or(Rejection::NoResolvableContext)?;
        body.splice(index..index + 1, lifted);
        let carried = CarriedHeading {
            id,
            title: section.title,
        };
        Ok((parent, range, carried))
    }

}

pub mod restorer {
    //! Cursor placement after a successful level change.

    use crate::core::*;

    /// Collapsed cursor at the start of the section's title, ready for the
    /// heading text to be typed.
    pub fn restore(outline: &Outline, section: SectionId) -> Result<Selection, Rejection> {
        outline
            .section(section)
            .ok_or(Rejection::NoResolvableContext)?;
        Ok(Selection::collapsed(Position::title(section)))
    }

}

pub mod command {
    //! The `change_heading_level` entry point: Resolve -> Plan -> Mutate ->
    //! Restore as one synchronous local transaction.

    use crate::config::OutlineConfig;
    use crate::core::*;
    use crate::mutator;
    use crate::planner::{self, EditPlan, LevelRequest};
    use crate::resolver::{StructuralContext, resolve};
    use crate::restorer::restore;
    use serde::Serialize;
    use std::borrow::Cow;
    use tracing::debug;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub enum ChangeOutcome {
        Applied {
            outline: Outline,
            selection: Selection,
            plan: EditPlan,
        },
        /// Nothing changed; the host treats this keystroke as a no-op.
        Rejected(Rejection),
    }

    impl ChangeOutcome {
        pub fn success(&self) -> bool {
            matches!(self, ChangeOutcome::Applied { .. })
        }

        pub fn outline(&self) -> Option<&Outline> {
            match self {
                ChangeOutcome::Applied { outline, .. } => Some(outline),
                ChangeOutcome::Rejected(_) => None,
            }
        }

        pub fn selection(&self) -> Option<&Selection> {
            match self {
                ChangeOutcome::Applied { selection, .. } => Some(selection),
                ChangeOutcome::Rejected(_) => None,
            }
        }

        pub fn rejection(&self) -> Option<&Rejection> {
            match self {
                ChangeOutcome::Rejected(rejection) => Some(rejection),
                ChangeOutcome::Applied { .. } => None,
            }
        }
    }

    /// Change the level of the content under `selection` to `level`.
    ///
    /// A selection inside a section title re-levels that section: its body is
    /// lifted into the parent and re-wrapped at the requested level under the
    /// same title and id. Any other selection wraps the selected blocks in a
    /// new, untitled section.
    pub fn change_heading_level(
        outline: &Outline,
        selection: &Selection,
        level: u8,
        config: &OutlineConfig,
    ) -> ChangeOutcome {
        match run(outline, selection, level, config) {
            Ok(outcome) => outcome,
            Err(rejection) => {
                debug!(reason = rejection.reason(), %rejection, "level change rejected");
                ChangeOutcome::Rejected(rejection)
            }
        }
    }

    fn run(
        outline: &Outline,
        selection: &Selection,
        level: u8,
        config: &OutlineConfig,
    ) -> Result<ChangeOutcome, Rejection> {
        let ctx = resolve(outline, selection)?;
        planner::guard(&ctx, outline)?;

        let heading = ctx.heading.or_else(|| lone_section(&ctx, outline));
        let (working, ctx, request) = match heading {
            Some(heading) => {
                let mut working = outline.clone();
                let (container, range, carried) = mutator::unwrap_heading(&mut working, heading)?;
                let lifted = Selection::new(
                    Position::body(container, range.start),
                    Position::body(container, range.end - 1),
                );
                let ctx = resolve(&working, &lifted)?;
                (Cow::Owned(working), ctx, LevelRequest::carrying(level, carried))
            }
            None => (Cow::Borrowed(outline), ctx, LevelRequest::new(level)),
        };

        let plan = planner::plan(&ctx, &request, &working, config)?;
        let applied = mutator::apply(&plan, &working, config)?;
        let selection = restore(&applied.outline, applied.section)?;
        Ok(ChangeOutcome::Applied {
            outline: applied.outline,
            selection,
            plan,
        })
    }

    /// A range covering exactly one section node re-levels that section,
    /// as if the cursor were in its title.
    fn lone_section(ctx: &StructuralContext, outline: &Outline) -> Option<SectionId> {
        if ctx.block_range.len() != 1 {
            return None;
        }
        outline
            .body(ctx.container)?
            .get(ctx.block_range.start)?
            .as_section()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::PlaceholderPolicy;
        use crate::format::format_outline;
        use crate::testing::{block_at, fixture, section_titled};
        use std::collections::BTreeSet;

        fn change(outline: &Outline, at: Position, level: u8) -> ChangeOutcome {
            change_heading_level(
                outline,
                &Selection::collapsed(at),
                level,
                &OutlineConfig::default(),
            )
        }

        fn applied_text(outcome: &ChangeOutcome) -> String {
            format_outline(outcome.outline().expect("level change applied"))
        }

        /// Ids of every non-placeholder block.
        fn content_ids(outline: &Outline) -> BTreeSet<BlockId> {
            outline
                .leaf_blocks()
                .into_iter()
                .filter(|b| !b.is_placeholder())
                .map(|b| b.id)
                .collect()
        }

        fn content_count(outline: &Outline) -> usize {
            outline
                .leaf_blocks()
                .into_iter()
                .filter(|b| !b.is_placeholder())
                .count()
        }

        #[test]
        fn scenario_a_same_level_yields_sibling_sections() {
            let outline = fixture("* L1\nParaA\nParaB\n");
            let outcome = change(&outline, block_at(&outline, "ParaB"), 1);
            assert!(outcome.success());
            assert_eq!(applied_text(&outcome), "* L1\nParaA\n* \nParaB\n");
        }

        #[test]
        fn scenario_b_simple_descend_wraps_body() {
            let outline = fixture("* L1\nParaA\n");
            let outcome = change(&outline, block_at(&outline, "ParaA"), 2);
            assert_eq!(applied_text(&outcome), "* L1\n** \nParaA\n");
        }

        #[test]
        fn scenario_c_descend_stops_at_same_level_section() {
            let outline = fixture("* L1\nParaA\n** L2\nParaB\n");
            let outcome = change(&outline, block_at(&outline, "ParaA"), 2);
            assert_eq!(applied_text(&outcome), "* L1\n** \nParaA\n** L2\nParaB\n");
        }

        #[test]
        fn scenario_d_ascend_rewraps_and_leaves_placeholder() {
            let outline = fixture("* L1\n*** L3\nParaX\n");
            let outcome = change(&outline, block_at(&outline, "ParaX"), 2);
            assert_eq!(applied_text(&outcome), "* L1\n*** L3\n\n** \nParaX\n");
        }

        #[test]
        fn cursor_is_restored_to_new_title() {
            let outline = fixture("* L1\nParaA\nParaB\n");
            let outcome = change(&outline, block_at(&outline, "ParaB"), 1);
            let ChangeOutcome::Applied {
                outline: after,
                selection,
                ..
            } = &outcome
            else {
                panic!("expected an applied change, got {:?}", outcome);
            };
            let Position::Title { section, offset } = selection.head else {
                panic!("cursor should be in a title");
            };
            assert!(selection.is_collapsed());
            assert_eq!(offset, 0);
            assert_eq!(after.section(section).unwrap().level, 1);
            assert!(after.section(section).unwrap().title.is_empty());
        }

        #[test]
        fn protected_title_is_never_changed() {
            let outline = fixture("* Doc\nintro\n** Part\nbody\n");
            let doc = section_titled(&outline, "Doc");
            for level in 1..=3 {
                let outcome = change(&outline, Position::title(doc), level);
                assert_eq!(outcome, ChangeOutcome::Rejected(Rejection::ProtectedTitle));
            }

            let whole_root = Selection::new(
                Position::body(Container::Root, 0),
                Position::body(Container::Root, 0),
            );
            let outcome = change_heading_level(&outline, &whole_root, 2, &OutlineConfig::default());
            assert_eq!(outcome.rejection(), Some(&Rejection::ProtectedTitle));
        }

        #[test]
        fn relevel_promotes_existing_heading() {
            let outline = fixture("* Doc\nParaA\n** Part\nParaB\n*** Sub\nParaC\n");
            let part = section_titled(&outline, "Part");
            let outcome = change(&outline, Position::title(part), 1);
            assert_eq!(
                applied_text(&outcome),
                "* Doc\nParaA\n* Part\nParaB\n*** Sub\nParaC\n"
            );
            // Same identity, cursor on its title.
            assert_eq!(
                outcome.selection(),
                Some(&Selection::collapsed(Position::title(part)))
            );
        }

        #[test]
        fn relevel_demotes_existing_heading() {
            let outline = fixture("* Doc\nintro\n* Part\nParaB\n** Sub\nParaC\n");
            let part = section_titled(&outline, "Part");
            let outcome = change(&outline, Position::title(part), 2);
            assert_eq!(
                applied_text(&outcome),
                "* Doc\nintro\n** Part\nParaB\n** Sub\nParaC\n"
            );
            assert_eq!(outcome.outline().unwrap().section(part).unwrap().level, 2);
        }

        #[test]
        fn relevel_ascend_does_not_leave_extra_placeholder() {
            let outline = fixture("* Doc\nintro\n** Mid\nm\n*** Part\np\n");
            let part = section_titled(&outline, "Part");
            let outcome = change(&outline, Position::title(part), 1);
            assert_eq!(
                applied_text(&outcome),
                "* Doc\nintro\n** Mid\nm\n* Part\np\n"
            );
        }

        #[test]
        fn selection_over_a_section_node_relevels_it() {
            let text = "* Doc\nd\n** T\nParaA\n** S\nParaB\n";
            let outline = fixture(text);
            let doc = Container::Section(section_titled(&outline, "Doc"));
            let s = section_titled(&outline, "S");
            let selections = [
                Selection::new(Position::title(s), Position::body(Container::Section(s), 0)),
                Selection::collapsed(Position::body(doc, 2)),
            ];
            for selection in selections {
                let mut current = outline.clone();
                for _ in 0..3 {
                    let outcome =
                        change_heading_level(&current, &selection, 2, &OutlineConfig::default());
                    current = outcome.outline().expect("level change applied").clone();
                    assert_eq!(format_outline(&current), text);
                    assert_eq!(
                        outcome.selection(),
                        Some(&Selection::collapsed(Position::title(s)))
                    );
                }
            }

            let deeper = change(&outline, Position::body(doc, 2), 3);
            assert_eq!(
                applied_text(&deeper),
                "* Doc\nd\n** T\nParaA\n*** S\nParaB\n"
            );
        }

        #[test]
        fn relevel_keeps_heading_whose_body_opens_with_a_subsection() {
            let outline = fixture("* Doc\nd\n* H\n** Sub\ns\n");
            let h = section_titled(&outline, "H");
            let outcome = change(&outline, Position::title(h), 2);
            assert_eq!(applied_text(&outcome), "* Doc\nd\n** H\n\n** Sub\ns\n");
        }

        #[test]
        fn root_preamble_cannot_displace_the_document_title() {
            let outline = fixture("preamble\n* Doc\nbody\n");
            let outcome = change(&outline, block_at(&outline, "preamble"), 1);
            assert_eq!(outcome.rejection(), Some(&Rejection::ProtectedTitle));
        }

        #[test]
        fn reapplying_current_level_is_idempotent() {
            let outline = fixture("* Doc\nParaA\nParaB\n");
            let first = change(&outline, block_at(&outline, "ParaB"), 1);
            let after_first = first.outline().unwrap().clone();
            let cursor = *first.selection().unwrap();

            let second = change_heading_level(&after_first, &cursor, 1, &OutlineConfig::default());
            assert!(second.success());
            assert_eq!(
                format_outline(second.outline().unwrap()),
                format_outline(&after_first)
            );
            assert_eq!(second.selection(), Some(&cursor));
        }

        #[test]
        fn successful_changes_preserve_invariants_and_content() {
            let text = "intro\n* Doc\nd\n** A\na1\na2\n**** Deep\nx\ny\n*** B\nb\n** C\nc\n* E\ne\n";
            let outline = fixture(text);
            let before = content_ids(&outline);
            let config = OutlineConfig::default();

            let mut selections = Vec::new();
            for id in outline.sections_in_order() {
                selections.push(Selection::collapsed(Position::title(id)));
                let len = outline.section(id).unwrap().body.len();
                for index in 0..len {
                    selections.push(Selection::collapsed(Position::body(
                        Container::Section(id),
                        index,
                    )));
                }
            }

            for selection in &selections {
                for level in 1..=5 {
                    let outcome = change_heading_level(&outline, selection, level, &config);
                    match &outcome {
                        ChangeOutcome::Applied { outline: after, .. } => {
                            assert_eq!(after.validate(config.max_level), Ok(()));
                            assert_eq!(content_ids(after), before);
                            assert_eq!(content_count(after), before.len());
                        }
                        ChangeOutcome::Rejected(rejection) => {
                            assert_ne!(rejection.reason(), "invariant-violation");
                        }
                    }
                }
            }
        }

        #[test]
        fn when_vacated_policy_only_fills_empty_sections() {
            let outline = fixture("* L1\n*** L3\nkeep\nParaX\n");
            let config = OutlineConfig {
                ascend_placeholder: PlaceholderPolicy::WhenVacated,
                ..OutlineConfig::default()
            };
            let at = Selection::collapsed(block_at(&outline, "ParaX"));
            let outcome = change_heading_level(&outline, &at, 2, &config);
            assert_eq!(applied_text(&outcome), "* L1\n*** L3\nkeep\n** \nParaX\n");
        }

        #[test]
        fn unknown_selection_is_a_no_op() {
            let outline = fixture("* Doc\nbody\n");
            let outcome = change(&outline, Position::title(SectionId::new()), 2);
            assert!(!outcome.success());
            assert_eq!(outcome.rejection(), Some(&Rejection::NoResolvableContext));
            assert_eq!(outcome.outline(), None);
        }
    }
}

pub mod session {
    //! A host editor's view of the core: explicit configuration, the latest
    //! local snapshot, and a commit hook that hands accepted edits to the
    //! editing surface and the sync layer.

    use crate::command::{ChangeOutcome, change_heading_level};
    use crate::config::OutlineConfig;
    use crate::core::{Outline, Selection};
    use anyhow::{Context, Result};
    use tracing::warn;

    /// Receives every accepted edit before the session adopts it.
    pub trait CommitHook {
        fn commit(&mut self, outline: &Outline, selection: &Selection) -> Result<()>;
    }

    /// Hook for hosts that read the session state back themselves.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopCommit;

    impl CommitHook for NoopCommit {
        fn commit(&mut self, _outline: &Outline, _selection: &Selection) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct Session<H: CommitHook = NoopCommit> {
        config: OutlineConfig,
        outline: Outline,
        selection: Selection,
        hook: H,
    }

    impl<H: CommitHook> Session<H> {
        pub fn new(config: OutlineConfig, outline: Outline, selection: Selection, hook: H) -> Self {
            Self {
                config,
                outline,
                selection,
                hook,
            }
        }

        pub fn config(&self) -> &OutlineConfig {
            &self.config
        }

        pub fn outline(&self) -> &Outline {
            &self.outline
        }

        pub fn selection(&self) -> &Selection {
            &self.selection
        }

        pub fn hook(&self) -> &H {
            &self.hook
        }

        pub fn set_selection(&mut self, selection: Selection) {
            self.selection = selection;
        }

        /// Adopt the latest local snapshot, e.g. after remote edits merged.
        pub fn sync(&mut self, outline: Outline, selection: Selection) {
            self.outline = outline;
            self.selection = selection;
        }

        /// Run the level change against the current snapshot. A rejection is
        /// returned as an outcome; only a failing commit hook is an error, and
        /// then the session keeps its previous state.
        pub fn change_heading_level(&mut self, level: u8) -> Result<ChangeOutcome> {
            let outcome = change_heading_level(&self.outline, &self.selection, level, &self.config);
            match &outcome {
                ChangeOutcome::Applied {
                    outline, selection, ..
                } => {
                    self.hook
                        .commit(outline, selection)
                        .context("committing level change")?;
                    self.outline = outline.clone();
                    self.selection = *selection;
                }
                ChangeOutcome::Rejected(rejection) => {
                    warn!(reason = rejection.reason(), level, "level change had no effect");
                }
            }
            Ok(outcome)
        }
    }

}

pub mod storage {
    use super::core::Outline;
    use anyhow::Result;
    use std::path::Path;

    /// Parsing is independent of where outlines come from.
    pub trait OutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Outline>;
    }
}

pub mod parser {
    //! Outline text reader built on `nom`.
    //!
    //! The top-level scan is line-oriented and stack-builds the section tree
    //! by heading level (`*`, `**`, ...). Each line is classified with `nom`
    //! combinators; any line that is not a heading, quote, rule or source
    //! fence becomes its own paragraph, and a blank line is a placeholder.

    use crate::core::*;
    use crate::storage::OutlineParser;
    use anyhow::{Context, Result, anyhow, bail};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag_no_case, take_till1, take_while_m_n, take_while1},
        character::complete::{anychar, char, not_line_ending, one_of, space0, space1},
        combinator::{eof, map, opt, rest},
        error::{ErrorKind, ParseError, VerboseError},
        sequence::{preceded, terminated},
    };
    use std::{fs, path::Path};

    /* ------------------------ Public entry points ------------------------ */

    /// Parse an outline from a string. Sections whose body would be empty get
    /// a placeholder so the result always satisfies the tree invariants
    /// (apart from levels, which `Outline::validate` checks against config).
    pub fn parse_outline(input: &str) -> Result<Outline> {
        let mut outline = Outline::new();
        // Open sections, innermost last.
        let mut stack: Vec<(SectionId, u8)> = Vec::new();
        let mut lines = input.lines().enumerate();

        while let Some((lineno, line)) = lines.next() {
            let container = stack
                .last()
                .map_or(Container::Root, |(id, _)| Container::Section(*id));

            if let Ok((_, (stars, title))) = headline(line) {
                let level = u8::try_from(stars)
                    .with_context(|| format!("line {}: heading nested too deep", lineno + 1))?;
                while stack.last().is_some_and(|(_, open)| *open >= level) {
                    stack.pop();
                }
                let parent = stack
                    .last()
                    .map_or(Container::Root, |(id, _)| Container::Section(*id));
                let id = outline
                    .push_section(parent, Section::new(level, rich_text(title)))
                    .ok_or_else(|| anyhow!("line {}: dangling parent section", lineno + 1))?;
                stack.push((id, level));
                continue;
            }

            let block = if let Ok((_, language)) = src_begin(line) {
                let mut code = String::new();
                loop {
                    let Some((_, inner)) = lines.next() else {
                        bail!("line {}: unterminated source block", lineno + 1);
                    };
                    if src_end(inner).is_ok() {
                        break;
                    }
                    code.push_str(inner);
                    code.push('\n');
                }
                Block::Code {
                    language: language.map(str::to_string),
                    code,
                }
            } else if rule(line).is_ok() {
                Block::HorizontalRule
            } else if let Ok((_, text)) = quote(line) {
                Block::Quote(rich_text(text))
            } else {
                Block::Paragraph(rich_text(line))
            };
            outline
                .body_mut(container)
                .ok_or_else(|| anyhow!("line {}: dangling container", lineno + 1))?
                .push(Node::Block(ContentBlock::new(block)));
        }

        for section in outline.sections.values_mut() {
            if section.body.is_empty() {
                section.body.push(Node::Block(ContentBlock::placeholder()));
            }
        }
        Ok(outline)
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct NomOutlineParser;

    impl OutlineParser for NomOutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Outline> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            parse_outline(&text).with_context(|| format!("parsing {:?}", abs_path))
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ---------------------------- Line classes ---------------------------- */

    /// `*`×level, then a space and the title. A bare run of stars is an
    /// untitled heading.
    fn headline(i: &str) -> PResult<'_, (usize, &str)> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, title) = alt((preceded(char(' '), rest), eof))(i)?;
        Ok((i, (stars.len(), title)))
    }

    fn src_begin(i: &str) -> PResult<'_, Option<&str>> {
        let (i, _) = tag_no_case("#+begin_src")(i)?;
        let (i, language) = opt(preceded(space1, take_till1(|c: char| c.is_whitespace())))(i)?;
        let (i, _) = terminated(not_line_ending, eof)(i)?;
        Ok((i, language))
    }

    fn src_end(i: &str) -> PResult<'_, ()> {
        let (i, _) = preceded(space0, tag_no_case("#+end_src"))(i)?;
        let (i, _) = terminated(space0, eof)(i)?;
        Ok((i, ()))
    }

    fn rule(i: &str) -> PResult<'_, ()> {
        let (i, _) = take_while_m_n(5, usize::MAX, |c: char| c == '-')(i)?;
        let (i, _) = eof(i)?;
        Ok((i, ()))
    }

    fn quote(i: &str) -> PResult<'_, &str> {
        let (i, _) = char('>')(i)?;
        alt((preceded(char(' '), rest), eof))(i)
    }

    /* --------------------------- INLINE MARKUP --------------------------- */

    const MARKERS: &str = "*/_+~=";

    fn rich_text(s: &str) -> RichText {
        let inlines = match inlines_until(s, None) {
            Ok((_, inlines)) => inlines,
            Err(_) => vec![Inline::Text(s.to_string())],
        };
        RichText { inlines }
    }

    /// Inline runs up to the `close` delimiter, or to the end of input when
    /// there is none. A missing `close` is a recoverable error so the opener
    /// falls back to literal text.
    fn inlines_until(mut i: &str, close: Option<char>) -> PResult<'_, Vec<Inline>> {
        let mut out = Vec::new();
        loop {
            match i.chars().next() {
                None if close.is_some() => {
                    return Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Eof)));
                }
                None => return Ok((i, out)),
                Some(c) if Some(c) == close => return Ok((i, out)),
                Some(_) => {}
            }
            let (rest, inline) = alt((literal, emphasis, plain, stray))(i)?;
            push_inline(&mut out, inline);
            i = rest;
        }
    }

    fn push_inline(out: &mut Vec<Inline>, inline: Inline) {
        if let (Some(Inline::Text(prev)), Inline::Text(s)) = (out.last_mut(), &inline) {
            prev.push_str(s);
            return;
        }
        out.push(inline);
    }

    /// `~code~` and `=verbatim=`: no nested markup.
    fn literal(i: &str) -> PResult<'_, Inline> {
        let (i, open) = one_of("~=")(i)?;
        let (i, body) = terminated(take_till1(move |c: char| c == open), char(open))(i)?;
        let inline = match open {
            '~' => Inline::Code(body.to_string()),
            _ => Inline::Verbatim(body.to_string()),
        };
        Ok((i, inline))
    }

    fn emphasis(i: &str) -> PResult<'_, Inline> {
        let (rest, open) = one_of("*/_+")(i)?;
        let kind = match open {
            '*' => Emphasis::Bold,
            '/' => Emphasis::Italic,
            '_' => Emphasis::Underline,
            _ => Emphasis::Strike,
        };
        if rest.starts_with([' ', open]) {
            return Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Verify)));
        }
        let (rest, children) = inlines_until(rest, Some(open))?;
        let (rest, _) = char(open)(rest)?;
        Ok((rest, Inline::Emphasis { kind, children }))
    }

    fn plain(i: &str) -> PResult<'_, Inline> {
        map(take_while1(|c: char| !MARKERS.contains(c)), |s: &str| {
            Inline::Text(s.to_string())
        })(i)
    }

    /// A marker that opens nothing is kept as text.
    fn stray(i: &str) -> PResult<'_, Inline> {
        map(anychar, |c| Inline::Text(c.to_string()))(i)
    }

}

pub mod format {
    use super::core::*;

    /// Canonical text rendering; `parse_outline` reads it back unchanged.
    pub fn format_outline(outline: &Outline) -> String {
        let mut out = String::new();
        render_body(outline, Container::Root, &mut out, &mut Vec::new());
        out
    }

    /// The position each rendered line belongs to, indexed by 0-based line
    /// number. Lines of a source block all map to the block.
    pub fn line_targets(outline: &Outline) -> Vec<Position> {
        let mut targets = Vec::new();
        render_body(outline, Container::Root, &mut String::new(), &mut targets);
        targets
    }

    fn render_body(
        outline: &Outline,
        container: Container,
        out: &mut String,
        targets: &mut Vec<Position>,
    ) {
        let Some(body) = outline.body(container) else {
            return;
        };
        for (index, node) in body.iter().enumerate() {
            match node {
                Node::Block(block) => {
                    let text = render_block(&block.block);
                    targets.extend(std::iter::repeat_n(
                        Position::body(container, index),
                        text.lines().count(),
                    ));
                    out.push_str(&text);
                }
                Node::Section(id) => {
                    let Some(section) = outline.section(*id) else {
                        continue;
                    };
                    out.push_str(&"*".repeat(usize::from(section.level)));
                    out.push(' ');
                    out.push_str(&render_rich_text(&section.title.inlines));
                    out.push('\n');
                    targets.push(Position::title(*id));
                    render_body(outline, Container::Section(*id), out, targets);
                }
            }
        }
    }

    fn render_block(block: &Block) -> String {
        match block {
            Block::Paragraph(text) => {
                let mut buf = render_rich_text(&text.inlines);
                buf.push('\n');
                buf
            }
            Block::Quote(text) if text.inlines.is_empty() => ">\n".to_string(),
            Block::Quote(text) => {
                let mut buf = String::from("> ");
                buf.push_str(&render_rich_text(&text.inlines));
                buf.push('\n');
                buf
            }
            Block::Code { language, code } => {
                let mut buf = String::new();
                buf.push_str("#+begin_src");
                if let Some(lang) = language {
                    buf.push(' ');
                    buf.push_str(lang);
                }
                buf.push('\n');
                buf.push_str(code);
                if !code.is_empty() && !code.ends_with('\n') {
                    buf.push('\n');
                }
                buf.push_str("#+end_src\n");
                buf
            }
            Block::HorizontalRule => "-----\n".to_string(),
        }
    }

    fn render_rich_text(inlines: &[Inline]) -> String {
        let mut buf = String::new();
        for inline in inlines {
            match inline {
                Inline::Text(t) => buf.push_str(t),
                Inline::Emphasis { kind, children } => {
                    buf.push(kind.delimiter());
                    buf.push_str(&render_rich_text(children));
                    buf.push(kind.delimiter());
                }
                Inline::Code(code) => {
                    buf.push('~');
                    buf.push_str(code);
                    buf.push('~');
                }
                Inline::Verbatim(verbatim) => {
                    buf.push('=');
                    buf.push_str(verbatim);
                    buf.push('=');
                }
            }
        }
        buf
    }

}


pub use command::{ChangeOutcome, change_heading_level};
pub use config::OutlineConfig;
pub use format::{format_outline, line_targets};
pub use parser::{NomOutlineParser, parse_outline};
pub use session::{CommitHook, NoopCommit, Session};
