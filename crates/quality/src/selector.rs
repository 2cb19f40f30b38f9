//! Path selectors over XML documents.
//!
//! Supports the XPath 1.0 location-path subset that rule sentences and budget
//! metrics use:
//! - absolute (`/a/b`) and relative (`a/b`) paths, `//` anywhere
//! - `.`, `..`, `*`, `@name`, `@*`, `text()`, `node()`
//! - explicit axes: `child::`, `descendant::`, `descendant-or-self::`,
//!   `attribute::`, `self::`, `parent::`
//! - predicates: `[path]`, `[path = 'lit']`, `[path != 'lit']`,
//!   `[path = 5]`, `[3]`
//! - unions of paths with `|`
//!
//! Results are returned in document order without duplicates. Namespace
//! prefixes are accepted and ignored; names match on the local part.
//!
//! [`Selector::select_unit`] evaluates as though one element were a document
//! of its own: absolute paths start above that element and never leave it.

use roxmltree::Node;

/// A selector that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector {expr:?} at offset {offset}: {message}")]
pub struct SelectorError {
    /// The selector text
    pub expr: String,
    /// Byte offset of the problem
    pub offset: usize,
    /// What went wrong
    pub message: String,
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    branches: Vec<LocationPath>,
}

#[derive(Debug, Clone, PartialEq)]
struct LocationPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Attribute,
    SelfAxis,
    Parent,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    AnyName,
    Text,
    AnyNode,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Position(usize),
    Exists(LocationPath),
    Compare {
        path: LocationPath,
        equal: bool,
        literal: Literal,
    },
}

/// One selected value: a node or an attribute.
#[derive(Debug, Clone, Copy)]
pub enum Item<'a, 'input: 'a> {
    /// Element, text or root node
    Node(Node<'a, 'input>),
    /// Attribute of `owner`
    Attribute {
        /// Element carrying the attribute
        owner: Node<'a, 'input>,
        /// Position among the owner's attributes
        slot: usize,
        /// Local name
        name: &'a str,
        /// Value
        value: &'a str,
    },
}

impl<'a, 'input: 'a> Item<'a, 'input> {
    /// XPath string-value of the item.
    pub fn string_value(&self) -> String {
        match self {
            Item::Node(node) => string_value(*node),
            Item::Attribute { value, .. } => (*value).to_string(),
        }
    }

    /// The node, unless the item is an attribute.
    pub fn as_node(&self) -> Option<Node<'a, 'input>> {
        match self {
            Item::Node(node) => Some(*node),
            Item::Attribute { .. } => None,
        }
    }

    /// Whether the item counts as an empty value.
    ///
    /// Elements always count as present; text nodes and attributes are blank
    /// when their text is empty.
    pub fn is_blank(&self) -> bool {
        match self {
            Item::Node(node) if node.is_text() => node.text().map_or(true, str::is_empty),
            Item::Node(_) => false,
            Item::Attribute { value, .. } => value.is_empty(),
        }
    }

    fn order_key(&self) -> (usize, usize) {
        match self {
            Item::Node(node) => (node.id().get() as usize, 0),
            Item::Attribute { owner, slot, .. } => (owner.id().get() as usize, slot + 1),
        }
    }
}

/// XPath string-value of a node: its text, or the concatenated text of its
/// descendants.
pub fn string_value(node: Node<'_, '_>) -> String {
    if node.is_text() {
        return node.text().unwrap_or_default().to_string();
    }
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

impl Selector {
    /// Parse a selector expression.
    pub fn parse(expr: &str) -> Result<Self, SelectorError> {
        let mut parser = Parser { src: expr, pos: 0 };
        parser.skip_ws();
        if parser.at_end() {
            return Err(parser.error("empty selector"));
        }

        let mut branches = vec![parser.parse_path()?];
        loop {
            parser.skip_ws();
            if parser.eat("|") {
                parser.skip_ws();
                branches.push(parser.parse_path()?);
            } else {
                break;
            }
        }
        if !parser.at_end() {
            return Err(parser.error("unexpected input"));
        }

        Ok(Self {
            source: expr.to_string(),
            branches,
        })
    }

    /// The selector text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a context node.
    pub fn select<'a, 'input: 'a>(&self, context: Node<'a, 'input>) -> Vec<Item<'a, 'input>> {
        self.select_in(context, Scope::document(context))
    }

    /// Evaluate against `unit` as if it were the root element of its own
    /// document.
    pub fn select_unit<'a, 'input: 'a>(&self, unit: Node<'a, 'input>) -> Vec<Item<'a, 'input>> {
        self.select_in(unit, Scope::unit(unit))
    }

    fn select_in<'a, 'input: 'a>(
        &self,
        context: Node<'a, 'input>,
        scope: Scope<'a, 'input>,
    ) -> Vec<Item<'a, 'input>> {
        let items = self
            .branches
            .iter()
            .flat_map(|path| eval_path(path, context, scope))
            .collect();
        normalise(items)
    }

    /// String-values of every selected item.
    pub fn select_strings(&self, context: Node<'_, '_>) -> Vec<String> {
        self.select(context).iter().map(Item::string_value).collect()
    }

    /// Selected nodes; attributes are dropped.
    pub fn select_nodes<'a, 'input: 'a>(&self, context: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
        self.select(context).iter().filter_map(Item::as_node).collect()
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where absolute paths start.
#[derive(Debug, Clone, Copy)]
struct Scope<'a, 'input: 'a> {
    top: Node<'a, 'input>,
    /// When set, `top` stands in for a document root whose only child is
    /// this element.
    unit: Option<Node<'a, 'input>>,
}

impl<'a, 'input: 'a> Scope<'a, 'input> {
    fn document(node: Node<'a, 'input>) -> Self {
        Self {
            top: node.document().root(),
            unit: None,
        }
    }

    fn unit(unit: Node<'a, 'input>) -> Self {
        match unit.parent() {
            Some(top) => Self {
                top,
                unit: Some(unit),
            },
            None => Self::document(unit),
        }
    }
}

fn eval_path<'a, 'input: 'a>(
    path: &LocationPath,
    context: Node<'a, 'input>,
    scope: Scope<'a, 'input>,
) -> Vec<Item<'a, 'input>> {
    let start = if path.absolute { scope.top } else { context };

    let mut current = vec![Item::Node(start)];
    for step in &path.steps {
        let mut next = Vec::new();
        for item in &current {
            let Item::Node(node) = *item else { continue };
            let mut matched = step.candidates(node, scope);
            for condition in &step.predicates {
                matched = condition.filter(matched, scope);
            }
            next.extend(matched);
        }
        current = normalise(next);
    }
    current
}

fn normalise<'a, 'input: 'a>(mut items: Vec<Item<'a, 'input>>) -> Vec<Item<'a, 'input>> {
    items.sort_by_key(Item::order_key);
    items.dedup_by_key(|item| item.order_key());
    items
}

impl Step {
    fn candidates<'a, 'input: 'a>(
        &self,
        node: Node<'a, 'input>,
        scope: Scope<'a, 'input>,
    ) -> Vec<Item<'a, 'input>> {
        let test = |n: &Node<'a, 'input>| self.test.matches(*n);
        if let Some(unit) = scope.unit.filter(|_| node == scope.top) {
            return match self.axis {
                Axis::Child => Some(unit).filter(test).map(Item::Node).into_iter().collect(),
                Axis::Descendant => unit.descendants().filter(test).map(Item::Node).collect(),
                Axis::DescendantOrSelf => std::iter::once(node)
                    .chain(unit.descendants())
                    .filter(test)
                    .map(Item::Node)
                    .collect(),
                Axis::SelfAxis => Some(node).filter(test).map(Item::Node).into_iter().collect(),
                Axis::Parent | Axis::Attribute => Vec::new(),
            };
        }
        match self.axis {
            Axis::Child => node.children().filter(test).map(Item::Node).collect(),
            Axis::Descendant => node.descendants().skip(1).filter(test).map(Item::Node).collect(),
            Axis::DescendantOrSelf => node.descendants().filter(test).map(Item::Node).collect(),
            Axis::SelfAxis => Some(node).filter(test).map(Item::Node).into_iter().collect(),
            Axis::Parent => node.parent().filter(test).map(Item::Node).into_iter().collect(),
            Axis::Attribute => node
                .attributes()
                .enumerate()
                .filter(|(_, attr)| self.test.matches_attribute(attr.name()))
                .map(|(slot, attr)| Item::Attribute {
                    owner: node,
                    slot,
                    name: attr.name(),
                    value: attr.value(),
                })
                .collect(),
        }
    }
}

impl NodeTest {
    fn matches(&self, node: Node<'_, '_>) -> bool {
        match self {
            NodeTest::Name(name) => node.is_element() && node.tag_name().name() == name,
            NodeTest::AnyName => node.is_element(),
            NodeTest::Text => node.is_text(),
            NodeTest::AnyNode => true,
        }
    }

    fn matches_attribute(&self, name: &str) -> bool {
        match self {
            NodeTest::Name(wanted) => wanted == name,
            NodeTest::AnyName | NodeTest::AnyNode => true,
            NodeTest::Text => false,
        }
    }
}

impl Condition {
    fn filter<'a, 'input: 'a>(
        &self,
        items: Vec<Item<'a, 'input>>,
        scope: Scope<'a, 'input>,
    ) -> Vec<Item<'a, 'input>> {
        match self {
            Condition::Position(position) => items.into_iter().nth(position - 1).into_iter().collect(),
            Condition::Exists(path) => items
                .into_iter()
                .filter(|item| {
                    item.as_node()
                        .map_or(false, |node| !eval_path(path, node, scope).is_empty())
                })
                .collect(),
            Condition::Compare { path, equal, literal } => items
                .into_iter()
                .filter(|item| {
                    item.as_node().map_or(false, |node| {
                        eval_path(path, node, scope)
                            .iter()
                            .any(|found| literal.compare(&found.string_value()) == *equal)
                    })
                })
                .collect(),
        }
    }
}

impl Literal {
    fn compare(&self, value: &str) -> bool {
        match self {
            Literal::Text(text) => value == text,
            Literal::Number(number) => value.trim().parse::<f64>().map_or(false, |v| v == *number),
        }
    }
}

struct Parser<'s> {
    src: &'s str,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, message: &str) -> SelectorError {
        SelectorError {
            expr: self.src.to_string(),
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn at_step_start(&self) -> bool {
        matches!(self.peek(), Some(c) if c.is_alphabetic() || matches!(c, '_' | '*' | '@' | '.'))
    }

    fn parse_path(&mut self) -> Result<LocationPath, SelectorError> {
        let mut steps = Vec::new();
        let absolute = if self.eat("//") {
            steps.push(descendant_or_self());
            true
        } else if self.eat("/") {
            if !self.at_step_start() {
                return Ok(LocationPath { absolute: true, steps });
            }
            true
        } else {
            false
        };

        loop {
            steps.push(self.parse_step()?);
            if self.eat("//") {
                steps.push(descendant_or_self());
            } else if !self.eat("/") {
                break;
            }
        }

        Ok(LocationPath { absolute, steps })
    }

    fn parse_step(&mut self) -> Result<Step, SelectorError> {
        if self.eat("..") {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            });
        }
        if self.eat(".") {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat("@") {
            Axis::Attribute
        } else {
            self.parse_axis_prefix()?.unwrap_or(Axis::Child)
        };

        let test = if self.eat("*") {
            NodeTest::AnyName
        } else {
            let name = self.parse_name()?;
            if axis != Axis::Attribute && name == "text" && self.eat("()") {
                NodeTest::Text
            } else if name == "node" && self.eat("()") {
                NodeTest::AnyNode
            } else {
                NodeTest::Name(local_part(name).to_string())
            }
        };

        let mut predicates = Vec::new();
        loop {
            self.skip_ws();
            if !self.eat("[") {
                break;
            }
            predicates.push(self.parse_condition()?);
            self.skip_ws();
            if !self.eat("]") {
                return Err(self.error("expected ']'"));
            }
        }

        Ok(Step { axis, test, predicates })
    }

    fn parse_axis_prefix(&mut self) -> Result<Option<Axis>, SelectorError> {
        let start = self.pos;
        let Ok(name) = self.parse_name() else {
            self.pos = start;
            return Ok(None);
        };
        if !self.eat("::") {
            self.pos = start;
            return Ok(None);
        }
        let axis = match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "attribute" => Axis::Attribute,
            "self" => Axis::SelfAxis,
            "parent" => Axis::Parent,
            _ => {
                self.pos = start;
                return Err(self.error("unsupported axis"));
            }
        };
        Ok(Some(axis))
    }

    fn parse_name(&mut self) -> Result<&'s str, SelectorError> {
        let start = self.pos;
        let rest = self.rest();
        let mut end = 0;
        let mut chars = rest.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            let valid = if idx == 0 {
                c.is_alphabetic() || c == '_'
            } else if c == ':' {
                // a single colon separates a prefix; "::" starts an axis
                !matches!(chars.peek(), Some((_, ':'))) && !rest[..idx].contains(':')
            } else {
                c.is_alphanumeric() || matches!(c, '-' | '_' | '.')
            };
            if !valid {
                break;
            }
            end = idx + c.len_utf8();
        }
        if end == 0 {
            return Err(self.error("expected a name"));
        }
        self.pos = start + end;
        Ok(&self.src[start..start + end])
    }

    fn parse_condition(&mut self) -> Result<Condition, SelectorError> {
        self.skip_ws();
        if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            let position = self.parse_number()?;
            if position < 1.0 || position.fract() != 0.0 {
                return Err(self.error("position must be a positive integer"));
            }
            return Ok(Condition::Position(position as usize));
        }

        let path = self.parse_path()?;
        self.skip_ws();
        let equal = if self.eat("!=") {
            false
        } else if self.eat("=") {
            true
        } else {
            return Ok(Condition::Exists(path));
        };
        self.skip_ws();
        let literal = self.parse_literal()?;
        Ok(Condition::Compare { path, equal, literal })
    }

    fn parse_literal(&mut self) -> Result<Literal, SelectorError> {
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let rest = self.rest();
                let Some(end) = rest.find(quote) else {
                    return Err(self.error("unterminated string literal"));
                };
                let text = rest[..end].to_string();
                self.pos += end + 1;
                Ok(Literal::Text(text))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(Literal::Number(self.parse_number()?)),
            _ => Err(self.error("expected a literal")),
        }
    }

    fn parse_number(&mut self) -> Result<f64, SelectorError> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|&(idx, c)| !(c.is_ascii_digit() || c == '.' || (idx == 0 && c == '-')))
            .map_or(rest.len(), |(idx, _)| idx);
        let number = rest[..len]
            .parse::<f64>()
            .map_err(|_| self.error("invalid number"))?;
        self.pos += len;
        Ok(number)
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::AnyNode,
        predicates: Vec::new(),
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<iati-activities>
  <iati-activity hierarchy="1">
    <iati-identifier>GB-1-1</iati-identifier>
    <title>Water and sanitation</title>
    <sector code="14030" percentage="60"/>
    <sector code="14031" percentage="40"/>
    <document-link url="a.pdf"><category code="B03"/><title>Kenya strategy</title></document-link>
    <document-link url="b.pdf"><category code="A01"/><title>Annual report</title></document-link>
    <transaction><value>10</value></transaction>
    <transaction><value>20</value></transaction>
  </iati-activity>
  <iati-activity>
    <iati-identifier></iati-identifier>
    <title/>
  </iati-activity>
</iati-activities>"#;

    fn strings(expr: &str, doc: &roxmltree::Document) -> Vec<String> {
        Selector::parse(expr).unwrap().select_strings(doc.root_element())
    }

    #[test]
    fn test_relative_child_path() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        let activity = doc.root_element().first_element_child().unwrap();
        let selector = Selector::parse("title/text()").unwrap();
        assert_eq!(selector.select_strings(activity), vec!["Water and sanitation"]);
    }

    #[test]
    fn test_descendant_and_attribute() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        assert_eq!(strings("//sector/@percentage", &doc), vec!["60", "40"]);
        assert_eq!(strings("//iati-activity/@hierarchy", &doc), vec!["1"]);
    }

    #[test]
    fn test_predicate_with_literal() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        assert_eq!(
            strings("//document-link[category/@code='B03']/title", &doc),
            vec!["Kenya strategy"]
        );
        assert_eq!(
            strings("//document-link[category/@code != 'B03']/@url", &doc),
            vec!["b.pdf"]
        );
    }

    #[test]
    fn test_numeric_and_positional_predicates() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        assert_eq!(strings("//transaction[value=20]/value", &doc), vec!["20"]);
        assert_eq!(strings("//transaction[1]/value", &doc), vec!["10"]);
        assert_eq!(strings("//sector[2]/@code", &doc), vec!["14031"]);
    }

    #[test]
    fn test_exists_predicate_and_parent() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        let nodes = Selector::parse("//iati-activity[@hierarchy]")
            .unwrap()
            .select_nodes(doc.root_element());
        assert_eq!(nodes.len(), 1);
        assert_eq!(strings("//category[@code='B03']/../@url", &doc), vec!["a.pdf"]);
    }

    #[test]
    fn test_union_in_document_order() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        assert_eq!(
            strings("//transaction/value | //iati-identifier", &doc),
            vec!["GB-1-1", "10", "20", ""]
        );
    }

    #[test]
    fn test_blank_values() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        let selector = Selector::parse("//iati-identifier/text()").unwrap();
        let items = selector.select(doc.root_element());
        assert_eq!(items.len(), 1);

        let elements = Selector::parse("//title").unwrap().select(doc.root_element());
        assert!(elements.iter().all(|item| !item.is_blank()));
    }

    #[test]
    fn test_explicit_axes_and_wildcards() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        assert_eq!(
            strings("descendant::transaction/child::value", &doc),
            vec!["10", "20"]
        );
        assert_eq!(strings("//sector[1]/@*", &doc), vec!["14030", "60"]);
        assert_eq!(
            Selector::parse("/iati-activities/*").unwrap().select_nodes(doc.root_element()).len(),
            2
        );
    }

    #[test]
    fn test_unit_scope_stops_at_the_unit() {
        let doc = roxmltree::Document::parse(XML).unwrap();
        let second = doc.root_element().last_element_child().unwrap();

        let selector = Selector::parse("//sector").unwrap();
        assert_eq!(selector.select(second).len(), 2);
        assert!(selector.select_unit(second).is_empty());

        let first = doc.root_element().first_element_child().unwrap();
        assert_eq!(selector.select_unit(first).len(), 2);
        assert_eq!(
            Selector::parse("/iati-activity/iati-identifier")
                .unwrap()
                .select_unit(first)
                .len(),
            1
        );
        assert!(Selector::parse("/iati-activities").unwrap().select_unit(first).is_empty());
        assert!(Selector::parse("../@*").unwrap().select_unit(first).is_empty());
        assert_eq!(
            Selector::parse("//iati-activity/@hierarchy")
                .unwrap()
                .select_unit(first)
                .len(),
            1
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("title/").is_err());
        assert!(Selector::parse("sector[@code='1'").is_err());
        assert!(Selector::parse("following::x").is_err());
        let err = Selector::parse("a b").unwrap_err();
        assert_eq!(err.offset, 2);
    }
}
