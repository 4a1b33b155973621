//! Abstract Syntax Tree types for composition expressions.

use std::collections::BTreeSet;

/// Keywords reserved by the composition grammar.
pub const KEYWORDS: [&str; 3] = ["AND", "OR", "NOT"];

/// Returns true if `word` is a reserved keyword (ASCII case-insensitive).
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

/// Returns true if `name` is a valid operand name: `[A-Za-z][A-Za-z0-9_]*`
/// and not a keyword.
pub fn is_operand_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !is_keyword(name)
}

/// Binary composition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryOperator {
    /// Set intersection.
    And,
    /// Set union.
    Or,
}

impl std::fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOperator::And => write!(f, "AND"),
            BinaryOperator::Or => write!(f, "OR"),
        }
    }
}

/// A parsed composition expression.
///
/// `AND` and `OR` share one precedence level and associate to the left, so
/// `A OR B AND C` is `(A OR B) AND C`.
///
/// A flat chain such as `A OR B OR ... OR Z` parses into a left-deep tree as
/// long as the chain. Traversals, comparisons, cloning and dropping walk that
/// left spine with a loop (see [`Expr::chain`]), so only parenthesis nesting
/// costs stack depth.
#[derive(Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    /// Reference to a named sub-query binding.
    Operand(String),
    /// Intersection: `left AND right`.
    And(Box<Expr>, Box<Expr>),
    /// Union: `left OR right`.
    Or(Box<Expr>, Box<Expr>),
    /// Complement against the universe: `NOT inner`.
    Not(Box<Expr>),
    /// Parenthesized group: `( inner )`.
    Nested(Box<Expr>),
}

impl Expr {
    /// Creates an operand reference.
    pub fn operand(name: impl Into<String>) -> Self {
        Expr::Operand(name.into())
    }

    /// Creates `left <operator> right`.
    pub fn binary(operator: BinaryOperator, left: Expr, right: Expr) -> Self {
        match operator {
            BinaryOperator::And => Expr::And(Box::new(left), Box::new(right)),
            BinaryOperator::Or => Expr::Or(Box::new(left), Box::new(right)),
        }
    }

    /// Combines `self AND other`.
    pub fn and(self, other: Expr) -> Self {
        Expr::binary(BinaryOperator::And, self, other)
    }

    /// Combines `self OR other`.
    pub fn or(self, other: Expr) -> Self {
        Expr::binary(BinaryOperator::Or, self, other)
    }

    /// Combines `self AND NOT other`.
    pub fn and_not(self, other: Expr) -> Self {
        self.and(other.negate())
    }

    /// Wraps the expression in `NOT`.
    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Wraps the expression in parentheses.
    pub fn grouped(self) -> Self {
        Expr::Nested(Box::new(self))
    }

    /// Strips any number of enclosing parentheses.
    pub fn unwrap_nested(&self) -> &Expr {
        let mut expr = self;
        while let Expr::Nested(inner) = expr {
            expr = &**inner;
        }
        expr
    }

    /// Returns the operands of a binary node, with its operator.
    pub fn as_binary(&self) -> Option<(BinaryOperator, &Expr, &Expr)> {
        match self {
            Expr::And(left, right) => Some((BinaryOperator::And, left, right)),
            Expr::Or(left, right) => Some((BinaryOperator::Or, left, right)),
            _ => None,
        }
    }

    /// Returns the negated expression if this is a `NOT` (ignoring parentheses).
    pub fn as_negation(&self) -> Option<&Expr> {
        match self.unwrap_nested() {
            Expr::Not(inner) => Some(inner),
            _ => None,
        }
    }

    /// Splits the left spine of binary nodes into its leftmost non-binary
    /// operand and the `(operator, right operand)` links applied to it, in
    /// evaluation order.
    ///
    /// `A AND B OR C` yields `A` and `[(And, B), (Or, C)]`. A non-binary
    /// expression yields itself and no links.
    ///
    /// ```rust
    /// use cohort_expr::{parse, BinaryOperator, Expr};
    ///
    /// let expr = parse("a AND b OR c").unwrap();
    /// let (head, links) = expr.chain();
    /// assert_eq!(head, &Expr::operand("a"));
    /// assert_eq!(links[1], (BinaryOperator::Or, &Expr::operand("c")));
    /// ```
    pub fn chain(&self) -> (&Expr, Vec<(BinaryOperator, &Expr)>) {
        let mut links = Vec::new();
        let mut head = self;
        while let Some((operator, left, right)) = head.as_binary() {
            links.push((operator, right));
            head = left;
        }
        links.reverse();
        (head, links)
    }

    /// Iterates over every node in pre-order, left operands first.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes { stack: vec![self] }
    }

    /// Returns the distinct operand names referenced by this expression.
    pub fn operands(&self) -> BTreeSet<&str> {
        self.operand_names().collect()
    }

    /// Operand names in order of appearance, counting repeats.
    pub fn operand_names(&self) -> impl Iterator<Item = &str> {
        self.nodes().filter_map(|node| match node {
            Expr::Operand(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns true if the expression references `name`.
    pub fn references(&self, name: &str) -> bool {
        self.operand_names().any(|operand| operand == name)
    }

    /// Number of operand references, counting repeats.
    pub fn reference_count(&self) -> usize {
        self.operand_names().count()
    }

    /// Depth of the tree; a single operand has depth 1.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((node, level)) = stack.pop() {
            deepest = deepest.max(level);
            match node {
                Expr::Operand(_) => {}
                Expr::And(left, right) | Expr::Or(left, right) => {
                    stack.push((&**right, level + 1));
                    stack.push((&**left, level + 1));
                }
                Expr::Not(inner) | Expr::Nested(inner) => stack.push((&**inner, level + 1)),
            }
        }
        deepest
    }

    /// Moves every non-leaf child into `out`, leaving empty operands behind.
    fn detach_children(&mut self, out: &mut Vec<Expr>) {
        let mut detach = |child: &mut Box<Expr>| {
            if !matches!(**child, Expr::Operand(_)) {
                out.push(std::mem::replace(&mut **child, Expr::Operand(String::new())));
            }
        };
        match self {
            Expr::Operand(_) => {}
            Expr::And(left, right) | Expr::Or(left, right) => {
                detach(left);
                detach(right);
            }
            Expr::Not(inner) | Expr::Nested(inner) => detach(inner),
        }
    }
}

/// Pre-order iterator over the nodes of an [`Expr`].
#[derive(Debug, Clone)]
pub struct Nodes<'a> {
    stack: Vec<&'a Expr>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Expr;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        match node {
            Expr::Operand(_) => {}
            Expr::And(left, right) | Expr::Or(left, right) => {
                self.stack.push(&**right);
                self.stack.push(&**left);
            }
            Expr::Not(inner) | Expr::Nested(inner) => self.stack.push(&**inner),
        }
        Some(node)
    }
}

impl Clone for Expr {
    fn clone(&self) -> Self {
        let (head, links) = self.chain();
        let mut out = match head {
            Expr::Operand(name) => Expr::Operand(name.clone()),
            Expr::Not(inner) => Expr::Not(inner.clone()),
            Expr::Nested(inner) => Expr::Nested(inner.clone()),
            Expr::And(left, right) => Expr::And(left.clone(), right.clone()),
            Expr::Or(left, right) => Expr::Or(left.clone(), right.clone()),
        };
        for (operator, right) in links {
            out = Expr::binary(operator, out, right.clone());
        }
        out
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        let (head, links) = self.chain();
        let (other_head, other_links) = other.chain();
        if links != other_links {
            return false;
        }
        match (head, other_head) {
            (Expr::Operand(a), Expr::Operand(b)) => a == b,
            (Expr::Not(a), Expr::Not(b)) | (Expr::Nested(a), Expr::Nested(b)) => a == b,
            (Expr::And(a, b), Expr::And(c, d)) | (Expr::Or(a, b), Expr::Or(c, d)) => {
                a == c && b == d
            }
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let (head, links) = self.chain();
        std::mem::discriminant(head).hash(state);
        match head {
            Expr::Operand(name) => name.hash(state),
            Expr::Not(inner) | Expr::Nested(inner) => inner.hash(state),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.hash(state);
                right.hash(state);
            }
        }
        links.hash(state);
    }
}

impl Drop for Expr {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(mut expr) = pending.pop() {
            expr.detach_children(&mut pending);
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (head, links) = self.chain();
        match head {
            Expr::Operand(name) => write!(f, "{}", name)?,
            Expr::Not(inner) => write!(f, "NOT {}", inner)?,
            Expr::Nested(inner) => write!(f, "({})", inner)?,
            Expr::And(left, right) => write!(f, "{} AND {}", left, right)?,
            Expr::Or(left, right) => write!(f, "{} OR {}", left, right)?,
        }
        for (operator, right) in links {
            // Binary right operands only come from the builders.
            if right.as_binary().is_some() {
                write!(f, " {} ({})", operator, right)?;
            } else {
                write!(f, " {} {}", operator, right)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_name_pattern() {
        assert!(is_operand_name("ancEncounter"));
        assert!(is_operand_name("a_1"));
        assert!(is_operand_name("TestedInLast12Months"));
        assert!(!is_operand_name("1abc"));
        assert!(!is_operand_name("_abc"));
        assert!(!is_operand_name("has-visit"));
        assert!(!is_operand_name(""));
        assert!(!is_operand_name("and"));
        assert!(!is_operand_name("NOT"));
    }

    #[test]
    fn test_builder_and_display() {
        let expr = Expr::operand("hasObs").and_not(Expr::operand("ancEncounter"));
        assert_eq!(expr.to_string(), "hasObs AND NOT ancEncounter");

        let grouped = Expr::operand("x")
            .or(Expr::operand("y"))
            .grouped()
            .and(Expr::operand("z"));
        assert_eq!(grouped.to_string(), "(x OR y) AND z");
    }

    #[test]
    fn test_operands_deduplicated() {
        let expr = Expr::operand("a")
            .and(Expr::operand("b"))
            .or(Expr::operand("a").negate());
        let names: Vec<&str> = expr.operands().into_iter().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(expr.reference_count(), 3);
        assert!(expr.references("b"));
        assert!(!expr.references("c"));
    }

    #[test]
    fn test_unwrap_nested_and_negation() {
        let expr = Expr::operand("a").negate().grouped().grouped();
        assert!(matches!(expr.unwrap_nested(), Expr::Not(_)));
        assert_eq!(expr.as_negation(), Some(&Expr::operand("a")));
        assert_eq!(Expr::operand("a").as_negation(), None);
    }

    #[test]
    fn test_chain_splits_left_spine() {
        let expr = Expr::operand("a")
            .and(Expr::operand("b").negate())
            .or(Expr::operand("c").grouped());
        let (head, links) = expr.chain();
        assert_eq!(head, &Expr::operand("a"));
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].0, BinaryOperator::And);
        assert_eq!(links[1], (BinaryOperator::Or, &Expr::operand("c").grouped()));

        let binding = Expr::operand("x");
        let (head, links) = binding.chain();
        assert_eq!(head, &Expr::operand("x"));
        assert!(links.is_empty());
    }

    #[test]
    fn test_nodes_pre_order() {
        let expr = Expr::operand("a").and(Expr::operand("b").negate());
        let names: Vec<&str> = expr.operand_names().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(expr.nodes().count(), 4);
    }

    #[test]
    fn test_right_nested_builder_display() {
        let expr = Expr::operand("a").and(Expr::operand("b").or(Expr::operand("c")));
        assert_eq!(expr.to_string(), "a AND (b OR c)");
    }

    #[test]
    fn test_long_chain_is_iterative() {
        let mut expr = Expr::operand("a0");
        for i in 1..20_000 {
            expr = expr.or(Expr::operand(format!("a{}", i)));
        }
        let copy = expr.clone();
        assert_eq!(copy, expr);
        assert_eq!(expr.reference_count(), 20_000);
        assert_eq!(expr.depth(), 20_000);
        assert!(expr.references("a19999"));
        assert!(expr.to_string().ends_with("a19998 OR a19999"));

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&expr, &mut hasher);
        drop(copy);
        drop(expr);
    }

    #[test]
    fn test_depth() {
        assert_eq!(Expr::operand("a").depth(), 1);
        let expr = Expr::operand("a").and(Expr::operand("b").negate());
        assert_eq!(expr.depth(), 3);
    }
}
