//! Chemical formula counter
//!
//! Parses formulas such as `H2O` or `Mg(OH)2` and prints the number of atoms
//! of each element as JSON. Multipliers on parenthesized groups are applied
//! and repeated elements summed while parsing, through parse actions.
//!
//! Usage:
//!   formula `<formula>`...   - Count each formula given on the command line
//!   formula                  - Read one formula per line from stdin
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use parsley::actions::convert_to_integer;
use parsley::chars::{ALPHAS, NUMS};
use parsley::{ExprId, Grammar, GrammarError, ParseAction, ParseError, ParseResults, Replacement, Token};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "formula")]
#[command(about = "Count the atoms in chemical formulas", version)]
struct Args {
    /// Formulas to count; read from stdin when none are given
    formulas: Vec<String>,

    /// Increase logging verbosity (-v: debug, -vv+: trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn directive_for_verbosity(v: u8) -> &'static str {
    match v {
        0 => "parsley=warn,formula=warn",
        1 => "parsley=debug,formula=debug",
        _ => "parsley=trace,formula=trace",
    }
}

/// Scale the counts of a parenthesized group by the group's multiplier.
fn multiply_contents() -> ParseAction {
    ParseAction::new(|_, toks| {
        let Some(Token::Nested(term)) = toks.first() else {
            return Ok(None);
        };
        let Some(Token::Nested(mut subgroup)) = term.lookup("subgroup") else {
            return Ok(None);
        };
        let mult = term.lookup("mult").and_then(|m| m.as_int()).unwrap_or(1);
        for i in 0..subgroup.len() {
            if let Some(Token::Nested(entry)) = subgroup.get_mut(i) {
                if let Some(Token::Int(count)) = entry.get_mut(1) {
                    *count *= mult;
                }
            }
        }
        Ok(Some(Replacement::Results(subgroup)))
    })
}

/// Merge `[symbol, count]` entries that name the same element.
fn sum_by_element() -> ParseAction {
    ParseAction::new(|_, toks| {
        let mut totals: Vec<(String, i64)> = Vec::new();
        for tok in toks.iter() {
            let Token::Nested(entry) = tok else {
                continue;
            };
            let (Some(symbol), Some(count)) = (entry.first_str(), entry.get(1).and_then(Token::as_int)) else {
                continue;
            };
            match totals.iter_mut().find(|(s, _)| s == symbol) {
                Some((_, total)) => *total += count,
                None => totals.push((symbol.to_string(), count)),
            }
        }
        if totals.len() == toks.len() {
            return Ok(None);
        }
        let merged: ParseResults = totals
            .into_iter()
            .map(|(symbol, count)| Token::Nested(ParseResults::from_tokens(vec![Token::Str(symbol), Token::Int(count)])))
            .collect();
        Ok(Some(Replacement::Results(merged)))
    })
}

/// `formula := term+`, `term := (element | "(" formula ")") [integer]`
fn formula_grammar() -> Result<(Grammar, ExprId), GrammarError> {
    let mut g = Grammar::new();
    let upper: String = ALPHAS.chars().filter(char::is_ascii_uppercase).collect();
    let lower: String = ALPHAS.chars().filter(char::is_ascii_lowercase).collect();

    let lpar = g.literal("(")?;
    let lpar = g.suppress(lpar);
    let rpar = g.literal(")")?;
    let rpar = g.suppress(rpar);
    let integer = g.word(NUMS)?;
    g.add_action(integer, convert_to_integer());
    let element = g.word2(&upper, &lower)?;

    let formula = g.forward();
    let inner = g.and(vec![lpar, formula, rpar]);
    let subgroup = g.group(inner);
    let subgroup = g.named(subgroup, "subgroup");
    let atom = g.match_first(vec![element, subgroup]);
    let mult = g.opt_default(integer, Token::Int(1));
    let mult = g.named(mult, "mult");
    let term = g.and(vec![atom, mult]);
    let term = g.group(term);
    g.add_action(term, multiply_contents());
    let terms = g.one_or_more(term);
    g.set_forward(formula, terms)?;
    g.add_action(formula, sum_by_element());
    g.validate(formula)?;
    Ok((g, formula))
}

fn count_atoms(g: &Grammar, root: ExprId, text: &str) -> Result<BTreeMap<String, i64>, ParseError> {
    let results = g.parse_string(root, text.trim(), true)?;
    debug!(formula = text, tokens = %results, "parsed");
    let mut counts = BTreeMap::new();
    for tok in results.iter() {
        if let Token::Nested(entry) = tok {
            if let (Some(symbol), Some(count)) = (entry.first_str(), entry.get(1).and_then(Token::as_int)) {
                *counts.entry(symbol.to_string()).or_insert(0) += count;
            }
        }
    }
    Ok(counts)
}

fn report(g: &Grammar, root: ExprId, text: &str) -> bool {
    match count_atoms(g, root, text) {
        Ok(counts) => {
            println!("{}", serde_json::json!(counts));
            true
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("  {}", e.marked_input_line());
            false
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(directive_for_verbosity(args.verbose))),
        )
        .with_writer(io::stderr)
        .init();

    let (g, root) = match formula_grammar() {
        Ok(built) => built,
        Err(e) => {
            eprintln!("Error building grammar: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut ok = true;
    if args.formulas.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            if !line.trim().is_empty() {
                ok &= report(&g, root, &line);
            }
        }
    } else {
        for formula in &args.formulas {
            ok &= report(&g, root, formula);
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
