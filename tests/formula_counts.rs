//! Chemical formula grammar: nested groups with multipliers, with counts
//! multiplied and summed by parse actions while matching.

use std::collections::BTreeMap;

use parsley::actions::convert_to_integer;
use parsley::{ExprId, Grammar, ParseAction, ParseResults, Replacement, Token};
use rstest::rstest;

fn entry_parts(tok: &Token) -> Option<(String, i64)> {
    let entry = tok.as_results()?;
    Some((entry.first_str()?.to_string(), entry.get(1)?.as_int()?))
}

fn formula_grammar() -> (Grammar, ExprId) {
    let mut g = Grammar::new();
    let lpar = g.literal("(").unwrap();
    let lpar = g.suppress(lpar);
    let rpar = g.literal(")").unwrap();
    let rpar = g.suppress(rpar);
    let integer = g.word("0123456789").unwrap();
    g.add_action(integer, convert_to_integer());
    let element = g.word2("ABCDEFGHIJKLMNOPQRSTUVWXYZ", "abcdefghijklmnopqrstuvwxyz").unwrap();

    let formula = g.forward();
    let inner = g.and(vec![lpar, formula, rpar]);
    let subgroup = g.group(inner);
    let subgroup = g.named(subgroup, "subgroup");
    let atom = g.match_first(vec![element, subgroup]);
    let mult = g.opt_default(integer, Token::Int(1));
    let mult = g.named(mult, "mult");
    let term = g.and(vec![atom, mult]);
    let term = g.group(term);

    g.add_action(
        term,
        ParseAction::new(|_, toks| {
            let Some(term) = toks.first().and_then(Token::as_results) else {
                return Ok(None);
            };
            let Some(Token::Nested(mut subgroup)) = term.lookup("subgroup") else {
                return Ok(None);
            };
            let mult = term.lookup("mult").and_then(|m| m.as_int()).unwrap_or(1);
            for i in 0..subgroup.len() {
                if let Some(Token::Nested(entry)) = subgroup.get_mut(i) {
                    if let Some(Token::Int(n)) = entry.get_mut(1) {
                        *n *= mult;
                    }
                }
            }
            Ok(Some(Replacement::Results(subgroup)))
        }),
    );
    let terms = g.one_or_more(term);
    g.set_forward(formula, terms).unwrap();
    g.add_action(
        formula,
        ParseAction::new(|_, toks| {
            let mut totals: BTreeMap<String, i64> = BTreeMap::new();
            for (symbol, n) in toks.iter().filter_map(entry_parts) {
                *totals.entry(symbol).or_default() += n;
            }
            if totals.len() == toks.len() {
                return Ok(None);
            }
            let merged: ParseResults = totals
                .into_iter()
                .map(|(s, n)| Token::Nested(ParseResults::from_tokens(vec![Token::Str(s), Token::Int(n)])))
                .collect();
            Ok(Some(Replacement::Results(merged)))
        }),
    );
    (g, formula)
}

fn counts(input: &str) -> Vec<(String, i64)> {
    let (g, root) = formula_grammar();
    let r = g.parse_string(root, input, true).unwrap();
    r.iter().filter_map(entry_parts).collect()
}

fn pairs(expected: &[(&str, i64)]) -> Vec<(String, i64)> {
    expected.iter().map(|(s, n)| (s.to_string(), *n)).collect()
}

#[rstest]
#[case("H2O", &[("H", 2), ("O", 1)])]
#[case("Mg(OH)2", &[("Mg", 1), ("O", 2), ("H", 2)])]
#[case("NaCl", &[("Na", 1), ("Cl", 1)])]
#[case("CH3COOH", &[("C", 2), ("H", 4), ("O", 2)])]
#[case("Ca3(PO4)2", &[("Ca", 3), ("P", 2), ("O", 8)])]
#[case("K4(Fe(CN)6)", &[("K", 4), ("Fe", 1), ("C", 6), ("N", 6)])]
fn formula_counts(#[case] input: &str, #[case] expected: &[(&str, i64)]) {
    let mut got = counts(input);
    let mut want = pairs(expected);
    got.sort();
    want.sort();
    assert_eq!(got, want);
}

#[test]
fn group_multiplier_keeps_order() {
    assert_eq!(counts("Mg(OH)2"), pairs(&[("Mg", 1), ("O", 2), ("H", 2)]));
}

#[rstest]
#[case("h2o", 0)]
#[case("H2(O", 2)]
#[case("H2)", 2)]
fn malformed_formulas(#[case] input: &str, #[case] loc: usize) {
    let (g, root) = formula_grammar();
    let err = g.parse_string(root, input, true).unwrap_err();
    assert_eq!(err.loc(), loc);
}
