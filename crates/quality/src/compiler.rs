//! Rule compiler: turns rule sentences into predicates.
//!
//! The grammar is an ordered list of sentence templates. The first template
//! whose pattern matches the start of a rule's text decides its meaning; text
//! that matches none of them is a syntax fault for that rule only.

use std::collections::{BTreeSet, HashMap};

use dq_core::{Level, RuleDefinition, RuleId};
use regex::Regex;
use roxmltree::Node;
use tracing::{debug, warn};

use crate::selector::{Item, Selector, SelectorError};

/// Three-valued predicate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    /// Holds
    True,
    /// Does not hold
    False,
    /// Cannot be decided
    Unknown,
}

impl From<bool> for Tri {
    fn from(value: bool) -> Self {
        if value {
            Tri::True
        } else {
            Tri::False
        }
    }
}

/// Rule text that matches no sentence template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rule {id}: unrecognised rule syntax: {text:?}")]
pub struct RuleSyntaxError {
    /// Rule identifier
    pub id: RuleId,
    /// Offending text
    pub text: String,
}

/// Fault raised while evaluating a predicate against one document unit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// The rule's selector does not parse
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// A number in the rule sentence is not usable
    #[error("rule operand {0:?} is not a valid {1}")]
    Operand(String, &'static str),

    /// A selected value could not be read as a number
    #[error("selected value {0:?} is not a number")]
    NotANumber(String),

    /// The sentence names a value kind with no check
    #[error("no check for values of kind {0:?}")]
    UnsupportedKind(String),
}

/// A selector compiled with its rule. Parse faults surface on evaluation so
/// they are recorded against the rule rather than aborting compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSelector(Result<Selector, SelectorError>);

impl RuleSelector {
    fn new(expr: &str) -> Self {
        Self(Selector::parse(expr))
    }

    fn select<'a, 'input: 'a>(&self, node: Node<'a, 'input>) -> Result<Vec<Item<'a, 'input>>, EvalError> {
        match &self.0 {
            Ok(selector) => Ok(selector.select_unit(node)),
            Err(e) => Err(e.clone().into()),
        }
    }

    fn present(&self, node: Node<'_, '_>) -> Result<i64, EvalError> {
        let count = self.select(node)?.iter().filter(|item| !item.is_blank()).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

/// A compiled rule sentence.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `{selector} exists?`
    Exists { selector: RuleSelector },
    /// `{a} or {b} exists?`
    EitherExists { first: RuleSelector, second: RuleSelector },
    /// `only one of {a} or {b} exists?`
    ExactlyOneExists { first: RuleSelector, second: RuleSelector },
    /// `{selector} exists N times?`
    ExistsTimes { selector: RuleSelector, times: String },
    /// `{selector} exists more than N times?`
    ExistsMoreThan { selector: RuleSelector, times: String },
    /// `{selector} has more than N characters?`
    LongerThan { selector: RuleSelector, chars: String },
    /// `{selector} sum to N?`
    SumTo { selector: RuleSelector, total: String },
    /// `{selector} is an integer?`
    IsInteger { selector: RuleSelector },
    /// `{selector} is an iso date?`, never decided
    IsIsoDate { selector: RuleSelector },
    /// `{selector} is a {kind}?` for a kind with no check
    IsUnsupported { selector: RuleSelector, kind: String },
}

impl Predicate {
    /// Evaluate against one document unit. Absolute paths in the rule see
    /// only `node` and its descendants.
    pub fn evaluate(&self, node: Node<'_, '_>) -> Result<Tri, EvalError> {
        match self {
            Predicate::Exists { selector } => Ok((selector.present(node)? > 0).into()),
            Predicate::EitherExists { first, second } => {
                Ok((first.present(node)? > 0 || second.present(node)? > 0).into())
            }
            Predicate::ExactlyOneExists { first, second } => {
                Ok(((first.present(node)? > 0) != (second.present(node)? > 0)).into())
            }
            Predicate::ExistsTimes { selector, times } => {
                Ok((selector.present(node)? == parse_count(times)?).into())
            }
            Predicate::ExistsMoreThan { selector, times } => {
                Ok((selector.present(node)? > parse_count(times)?).into())
            }
            Predicate::LongerThan { selector, chars } => {
                let limit = parse_count(chars)?;
                let values = selector.select(node)?;
                Ok(values
                    .iter()
                    .any(|item| {
                        let len = i64::try_from(item.string_value().chars().count()).unwrap_or(i64::MAX);
                        len > limit
                    })
                    .into())
            }
            Predicate::SumTo { selector, total } => {
                let expected = parse_float(total)
                    .ok_or_else(|| EvalError::Operand(total.clone(), "number"))?;
                let mut sum = 0.0;
                for item in selector.select(node)? {
                    let value = item.string_value();
                    if value.is_empty() {
                        continue;
                    }
                    sum += parse_float(&value).ok_or(EvalError::NotANumber(value))?;
                }
                Ok((sum == expected).into())
            }
            Predicate::IsInteger { selector } => {
                let values = selector.select(node)?;
                // an empty selection is not a list of integers
                if values.is_empty() {
                    return Ok(Tri::False);
                }
                Ok(values.iter().all(|item| is_integer(&item.string_value())).into())
            }
            Predicate::IsIsoDate { .. } => Ok(Tri::Unknown),
            Predicate::IsUnsupported { kind, .. } => Err(EvalError::UnsupportedKind(kind.clone())),
        }
    }
}

fn parse_count(text: &str) -> Result<i64, EvalError> {
    text.trim()
        .parse()
        .map_err(|_| EvalError::Operand(text.to_string(), "integer"))
}

fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

fn is_integer(text: &str) -> bool {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Whether a rule line is a comment or blank and should not be compiled.
pub fn ignore_line(text: &str) -> bool {
    text.starts_with('#') || text.trim().is_empty()
}

#[derive(Debug, Clone, Copy)]
enum Template {
    IsA,
    LongerThan,
    SumTo,
    ExistsTimes,
    ExistsMoreThan,
    ExactlyOneExists,
    EitherExists,
    Exists,
}

/// Grammar in priority order. Patterns anchor at the start of the text only.
const GRAMMAR: [(&str, Template); 8] = [
    (r"^(\S*) is an? (.*)\?", Template::IsA),
    (r"^(\S*) has more than (\S*) characters\?", Template::LongerThan),
    (r"^(\S*) sum to (\S*)\?", Template::SumTo),
    (r"^(\S*) exists (\S*) times?\?", Template::ExistsTimes),
    (r"^(\S*) exists more than (\S*) times?\?", Template::ExistsMoreThan),
    (r"^only one of (\S*) or (\S*) exists\?", Template::ExactlyOneExists),
    (r"^(\S*) or (\S*) exists\?", Template::EitherExists),
    (r"^(\S*) exists\?", Template::Exists),
];

/// Compiles rule definitions into predicates.
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    grammar: Vec<(Regex, Template)>,
    levels: BTreeSet<Level>,
}

impl RuleCompiler {
    /// Create a compiler for activity-level rules.
    pub fn new() -> Result<Self, regex::Error> {
        let grammar = GRAMMAR
            .iter()
            .map(|(pattern, template)| Ok((Regex::new(pattern)?, *template)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            grammar,
            levels: BTreeSet::from([Level::Activity]),
        })
    }

    /// Compile rules of these levels instead.
    pub fn with_levels(mut self, levels: impl IntoIterator<Item = Level>) -> Self {
        self.levels = levels.into_iter().collect();
        self
    }

    /// Levels whose rules are compiled.
    pub fn levels(&self) -> &BTreeSet<Level> {
        &self.levels
    }

    /// Compile one rule sentence.
    pub fn compile_one(&self, id: RuleId, text: &str) -> Result<Predicate, RuleSyntaxError> {
        for (regex, template) in &self.grammar {
            let Some(caps) = regex.captures(text) else { continue };
            let group = |i: usize| caps.get(i).map_or("", |m| m.as_str());
            let selector = || RuleSelector::new(group(1));
            let predicate = match template {
                Template::IsA => match group(2) {
                    "iso date" => Predicate::IsIsoDate { selector: selector() },
                    "integer" => Predicate::IsInteger { selector: selector() },
                    kind => Predicate::IsUnsupported {
                        selector: selector(),
                        kind: kind.to_string(),
                    },
                },
                Template::LongerThan => Predicate::LongerThan {
                    selector: selector(),
                    chars: group(2).to_string(),
                },
                Template::SumTo => Predicate::SumTo {
                    selector: selector(),
                    total: group(2).to_string(),
                },
                Template::ExistsTimes => Predicate::ExistsTimes {
                    selector: selector(),
                    times: group(2).to_string(),
                },
                Template::ExistsMoreThan => Predicate::ExistsMoreThan {
                    selector: selector(),
                    times: group(2).to_string(),
                },
                Template::ExactlyOneExists => Predicate::ExactlyOneExists {
                    first: selector(),
                    second: RuleSelector::new(group(2)),
                },
                Template::EitherExists => Predicate::EitherExists {
                    first: selector(),
                    second: RuleSelector::new(group(2)),
                },
                Template::Exists => Predicate::Exists { selector: selector() },
            };
            return Ok(predicate);
        }

        Err(RuleSyntaxError {
            id,
            text: text.to_string(),
        })
    }

    /// Compile every eligible rule in one pass.
    ///
    /// Rules outside the compiled levels, comment lines and blank lines are
    /// skipped. A syntax fault excludes only the offending rule.
    pub fn compile(&self, rules: &[RuleDefinition]) -> CompiledRules {
        let mut compiled = CompiledRules::default();

        for rule in rules {
            if !self.levels.contains(&rule.level) || ignore_line(&rule.text) {
                continue;
            }
            if compiled.predicates.contains_key(&rule.id) {
                warn!("Duplicate rule id {}; keeping the first definition", rule.id);
                continue;
            }
            match self.compile_one(rule.id, &rule.text) {
                Ok(predicate) => {
                    debug!("Compiled rule {}: {}", rule.id, rule.text);
                    compiled.predicates.insert(rule.id, predicate);
                    compiled.rules.push(rule.clone());
                }
                Err(fault) => {
                    warn!("{}", fault);
                    compiled.faults.push(fault);
                }
            }
        }

        compiled
    }
}

/// Result of compiling a rule set.
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    rules: Vec<RuleDefinition>,
    predicates: HashMap<RuleId, Predicate>,
    faults: Vec<RuleSyntaxError>,
}

impl CompiledRules {
    /// Predicate for a rule.
    pub fn get(&self, id: RuleId) -> Option<&Predicate> {
        self.predicates.get(&id)
    }

    /// The id -> predicate map.
    pub fn predicates(&self) -> &HashMap<RuleId, Predicate> {
        &self.predicates
    }

    /// Rules that failed to compile.
    pub fn faults(&self) -> &[RuleSyntaxError] {
        &self.faults
    }

    /// Number of compiled predicates.
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Whether nothing compiled.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Active compiled rules of a level, in definition order.
    pub fn for_level(&self, level: Level) -> Vec<(RuleId, &Predicate)> {
        self.rules
            .iter()
            .filter(|rule| rule.active && rule.level == level)
            .filter_map(|rule| self.predicates.get(&rule.id).map(|p| (rule.id, p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;

    const ACTIVITY: &str = r#"<iati-activity hierarchy="1">
        <iati-identifier>GB-1-123</iati-identifier>
        <title>Water and sanitation programme</title>
        <description/>
        <sector code="11110" percentage="60"/>
        <sector code="12220" percentage="40"/>
        <budget><value>10</value></budget>
        <budget><value>20</value></budget>
        <budget><value/></budget>
        <activity-date iso-date="2012-01-01"/>
        <result value=""/>
        <result value="2"/>
        <result value="3.5"/>
        <tag code="ab"/>
        <tag code="abcdef"/>
    </iati-activity>"#;

    fn compiler() -> RuleCompiler {
        RuleCompiler::new().unwrap()
    }

    fn eval(text: &str) -> Result<Tri, EvalError> {
        let doc = parse_document(ACTIVITY).unwrap();
        compiler()
            .compile_one(RuleId(1), text)
            .unwrap()
            .evaluate(doc.root_element())
    }

    #[test]
    fn test_exists() {
        assert_eq!(eval("iati-identifier exists?").unwrap(), Tri::True);
        assert_eq!(eval("reporting-org exists?").unwrap(), Tri::False);
        // an empty element still counts as present
        assert_eq!(eval("description exists?").unwrap(), Tri::True);
        assert_eq!(eval("description/text() exists?").unwrap(), Tri::False);
    }

    #[test]
    fn test_either_and_exactly_one() {
        assert_eq!(eval("reporting-org or title exists?").unwrap(), Tri::True);
        assert_eq!(eval("reporting-org or participating-org exists?").unwrap(), Tri::False);
        assert_eq!(eval("only one of title or reporting-org exists?").unwrap(), Tri::True);
        assert_eq!(eval("only one of title or iati-identifier exists?").unwrap(), Tri::False);
        assert_eq!(eval("only one of a or b exists?").unwrap(), Tri::False);
    }

    #[test]
    fn test_exists_counts() {
        assert_eq!(eval("sector exists 2 times?").unwrap(), Tri::True);
        assert_eq!(eval("title exists 1 time?").unwrap(), Tri::True);
        assert_eq!(eval("sector exists 3 times?").unwrap(), Tri::False);
        assert_eq!(eval("sector exists more than 1 time?").unwrap(), Tri::True);
        assert_eq!(eval("sector exists more than 2 times?").unwrap(), Tri::False);
        assert_eq!(eval("nothing exists more than -1 times?").unwrap(), Tri::True);
    }

    #[test]
    fn test_more_than_characters() {
        assert_eq!(eval("title/text() has more than 10 characters?").unwrap(), Tri::True);
        assert_eq!(eval("title/text() has more than 100 characters?").unwrap(), Tri::False);
        assert_eq!(eval("missing has more than 0 characters?").unwrap(), Tri::False);
        // any one long value is enough
        assert_eq!(eval("tag/@code has more than 3 characters?").unwrap(), Tri::True);
        assert_eq!(eval("tag/@code has more than 6 characters?").unwrap(), Tri::False);
    }

    #[test]
    fn test_sum_to() {
        assert_eq!(eval("sector/@percentage sum to 100?").unwrap(), Tri::True);
        assert_eq!(eval("sector/@percentage sum to 99?").unwrap(), Tri::False);
        assert_eq!(eval("budget/value/text() sum to 30?").unwrap(), Tri::True);
        assert_eq!(eval("missing sum to 0?").unwrap(), Tri::True);
        // the empty attribute is left out of the sum
        assert_eq!(eval("result/@value sum to 5.5?").unwrap(), Tri::True);
        assert_eq!(eval("result/@value sum to 6?").unwrap(), Tri::False);
    }

    #[test]
    fn test_sum_to_non_numeric_is_error() {
        assert!(matches!(
            eval("iati-identifier/text() sum to 1?"),
            Err(EvalError::NotANumber(_))
        ));
        assert!(matches!(
            eval("sector/@percentage sum to lots?"),
            Err(EvalError::Operand(_, _))
        ));
    }

    #[test]
    fn test_is_an_integer() {
        assert_eq!(eval("sector/@code is an integer?").unwrap(), Tri::True);
        assert_eq!(eval("title/text() is an integer?").unwrap(), Tri::False);
        assert_eq!(eval("missing is an integer?").unwrap(), Tri::False);
    }

    #[test]
    fn test_iso_date_is_unknown() {
        assert_eq!(eval("activity-date/@iso-date is an iso date?").unwrap(), Tri::Unknown);
    }

    #[test]
    fn test_unsupported_kind_is_error() {
        assert!(matches!(
            eval("title is a url?"),
            Err(EvalError::UnsupportedKind(kind)) if kind == "url"
        ));
    }

    #[test]
    fn test_bad_selector_is_error_at_evaluation() {
        let compiled = compiler().compile_one(RuleId(1), "a[[ exists?");
        assert!(compiled.is_ok());
        assert!(matches!(eval("a[[ exists?"), Err(EvalError::Selector(_))));
    }

    #[test]
    fn test_absolute_paths_stay_inside_the_unit() {
        let doc = parse_document(
            r#"<iati-activities>
                <iati-activity><participating-org role="funding"/></iati-activity>
                <iati-activity><title>Second</title></iati-activity>
            </iati-activities>"#,
        )
        .unwrap();
        let activities: Vec<_> = doc.root_element().children().filter(|n| n.is_element()).collect();
        let predicate = compiler()
            .compile_one(RuleId(1), "//participating-org[@role='funding'] exists?")
            .unwrap();

        assert_eq!(predicate.evaluate(activities[0]).unwrap(), Tri::True);
        assert_eq!(predicate.evaluate(activities[1]).unwrap(), Tri::False);
    }

    #[test]
    fn test_compiling_twice_gives_the_same_predicates() {
        let rules: Vec<_> = [
            "title exists?",
            "sector/@percentage sum to 100?",
            "only one of title or reporting-org exists?",
            "tag/@code has more than 3 characters?",
        ]
        .into_iter()
        .enumerate()
        .map(|(idx, text)| RuleDefinition::new(RuleId(idx as i64 + 1), text, Level::Activity))
        .collect();

        let first = compiler().compile(&rules);
        let second = compiler().compile(&rules);
        assert_eq!(first.predicates(), second.predicates());

        let doc = parse_document(ACTIVITY).unwrap();
        for (id, predicate) in first.for_level(Level::Activity) {
            let again = second.get(id).unwrap();
            assert_eq!(
                predicate.evaluate(doc.root_element()),
                again.evaluate(doc.root_element())
            );
        }
    }

    #[test]
    fn test_unrecognised_sentence() {
        let err = compiler().compile_one(RuleId(7), "title looks fine").unwrap_err();
        assert_eq!(err.id, RuleId(7));
        assert_eq!(err.text, "title looks fine");
    }

    #[test]
    fn test_templates_take_priority_in_order() {
        // "exists more than" must not be read as "exists N times"
        let predicate = compiler()
            .compile_one(RuleId(1), "sector exists more than 2 times?")
            .unwrap();
        assert!(matches!(predicate, Predicate::ExistsMoreThan { .. }));

        // matching is anchored at the start only
        let predicate = compiler()
            .compile_one(RuleId(1), "title exists? trailing words")
            .unwrap();
        assert!(matches!(predicate, Predicate::Exists { .. }));
    }

    #[test]
    fn test_compile_skips_comments_blanks_and_other_levels() {
        let rules = vec![
            RuleDefinition::new(RuleId(1), "# a comment", Level::Activity),
            RuleDefinition::new(RuleId(2), "   ", Level::Activity),
            RuleDefinition::new(RuleId(3), "title exists?", Level::Activity),
            RuleDefinition::new(RuleId(4), "name exists?", Level::Organisation),
            RuleDefinition::new(RuleId(5), "nonsense", Level::Activity),
            RuleDefinition::new(RuleId(6), "value exists?", Level::Transaction),
        ];

        let compiled = compiler().compile(&rules);
        assert_eq!(compiled.len(), 1);
        assert!(compiled.get(RuleId(3)).is_some());
        assert_eq!(compiled.faults().len(), 1);
        assert_eq!(compiled.faults()[0].id, RuleId(5));

        let all = compiler().with_levels(Level::ALL).compile(&rules);
        assert_eq!(all.len(), 3);
        assert_eq!(all.for_level(Level::Transaction).len(), 1);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let rules = vec![
            RuleDefinition::new(RuleId(1), "title exists?", Level::Activity),
            RuleDefinition::new(RuleId(1), "sector exists?", Level::Activity),
        ];
        let compiled = compiler().compile(&rules);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled.for_level(Level::Activity).len(), 1);
    }

    #[test]
    fn test_for_level_skips_inactive_and_keeps_order() {
        let mut inactive = RuleDefinition::new(RuleId(2), "sector exists?", Level::Activity);
        inactive.active = false;
        let rules = vec![
            RuleDefinition::new(RuleId(9), "title exists?", Level::Activity),
            inactive,
            RuleDefinition::new(RuleId(3), "budget exists?", Level::Activity),
        ];
        let compiled = compiler().compile(&rules);
        let ids: Vec<_> = compiled
            .for_level(Level::Activity)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![RuleId(9), RuleId(3)]);
    }
}
