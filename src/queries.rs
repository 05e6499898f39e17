//! placeholder translation: client side `%s` style templates into the
//! server's native `$1 .. $n` form.
//!
//! the scanner is hand rolled rather than a regex so diagnostics can name the
//! exact offending byte offset and adversarial templates cannot blow up the
//! parse.

use bytes::Bytes;
use memchr::memchr;
use postgres_types::Oid;

use crate::{
    adapt::ParamFormat,
    errors::{Error, ProgrammingError},
    pq::Format,
    transform::Transformer,
    value::SqlValue,
};

/// parameters accompanying a query template.
pub enum Params<'a> {
    None,
    Positional(&'a [&'a dyn SqlValue]),
    Named(&'a [(&'a str, &'a dyn SqlValue)]),
}

impl<'a> Params<'a> {
    /// a cheap second borrow of the same parameters.
    pub fn reborrow(&self) -> Params<'a> {
        match self {
            Self::None => Params::None,
            Self::Positional(p) => Params::Positional(p),
            Self::Named(p) => Params::Named(p),
        }
    }
}

impl<'a> From<&'a [&'a dyn SqlValue]> for Params<'a> {
    fn from(params: &'a [&'a dyn SqlValue]) -> Self {
        Self::Positional(params)
    }
}

impl<'a> From<&'a [(&'a str, &'a dyn SqlValue)]> for Params<'a> {
    fn from(params: &'a [(&'a str, &'a dyn SqlValue)]) -> Self {
        Self::Named(params)
    }
}

/// a query translated to the server's shape, with dumped parameters.
pub struct PostgresQuery {
    /// the rewritten statement.
    pub query: Bytes,
    /// one dumped value (or NULL) per `$n` slot.
    pub params: Vec<Option<Bytes>>,
    /// parameter oids; 0 lets the server infer.
    pub types: Vec<Oid>,
    /// wire format per parameter.
    pub formats: Vec<Format>,
}

impl PostgresQuery {
    /// translate a template and dump its parameters through the transformer.
    pub fn convert(template: &str, params: Params<'_>, tx: &mut Transformer) -> Result<Self, Error> {
        let parsed = ParsedQuery::parse(template.as_bytes())?;
        Self::from_parsed(&parsed, params, tx)
    }

    /// dump parameters against an already scanned template.
    pub fn from_parsed(parsed: &ParsedQuery, params: Params<'_>, tx: &mut Transformer) -> Result<Self, Error> {
        let ordered = parsed.order_params(&params)?;
        let (values, types, formats) = tx.dump_sequence(&ordered, &parsed.formats)?;
        Ok(Self {
            query: parsed.rewritten.clone(),
            params: values,
            types,
            formats,
        })
    }

    /// re-dump a fresh parameter set against an already translated template:
    /// the `executemany` path, which never re-parses.
    pub fn redump(&mut self, parsed: &ParsedQuery, params: &Params<'_>, tx: &mut Transformer) -> Result<(), Error> {
        let ordered = parsed.order_params(params)?;
        let (values, types, formats) = tx.dump_sequence(&ordered, &parsed.formats)?;
        self.params = values;
        self.types = types;
        self.formats = formats;
        Ok(())
    }
}

enum Order {
    Positional(usize),
    Named(Vec<String>),
}

/// the outcome of scanning a template: the rewritten bytes, the per-slot
/// requested formats, and how host parameters map onto slots.
pub struct ParsedQuery {
    pub(crate) rewritten: Bytes,
    formats: Vec<ParamFormat>,
    order: Order,
}

impl ParsedQuery {
    pub fn parse(template: &[u8]) -> Result<Self, Error> {
        let mut out = Vec::with_capacity(template.len());
        let mut formats = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut positional = 0usize;
        let mut pos = 0usize;

        while let Some(found) = memchr(b'%', &template[pos..]) {
            let at = pos + found;
            out.extend_from_slice(&template[pos..at]);

            match template.get(at + 1) {
                None => return Err(scan_error("incomplete placeholder", at)),
                Some(b'%') => {
                    out.push(b'%');
                    pos = at + 2;
                }
                Some(b' ') => {
                    return Err(scan_error("space after %; did you mean %%?", at));
                }
                Some(&(f @ (b's' | b't' | b'b'))) => {
                    if !names.is_empty() {
                        return Err(mix_error());
                    }
                    positional += 1;
                    formats.push(placeholder_format(f));
                    out.extend_from_slice(format!("${positional}").as_bytes());
                    pos = at + 2;
                }
                Some(b'(') => {
                    let name_start = at + 2;
                    let close = memchr(b')', &template[name_start..])
                        .map(|i| name_start + i)
                        .ok_or_else(|| scan_error("unterminated placeholder name", at))?;
                    let name = core::str::from_utf8(&template[name_start..close])
                        .map_err(|_| scan_error("placeholder name is not valid utf8", at))?
                        .to_string();
                    let f = match template.get(close + 1) {
                        Some(&(f @ (b's' | b't' | b'b'))) => f,
                        _ => return Err(scan_error("bad or missing format after placeholder name", at)),
                    };
                    if positional > 0 {
                        return Err(mix_error());
                    }
                    // duplicate names share one parameter slot
                    let slot = match names.iter().position(|n| n == &name) {
                        Some(slot) => slot,
                        None => {
                            names.push(name);
                            formats.push(placeholder_format(f));
                            names.len() - 1
                        }
                    };
                    out.extend_from_slice(format!("${}", slot + 1).as_bytes());
                    pos = close + 2;
                }
                Some(_) => {
                    return Err(scan_error("bad placeholder; only %s, %b, %t and %(name)s are supported", at));
                }
            }
        }
        out.extend_from_slice(&template[pos..]);

        let order = if names.is_empty() {
            Order::Positional(positional)
        } else {
            Order::Named(names)
        };

        Ok(Self {
            rewritten: Bytes::from(out),
            formats,
            order,
        })
    }

    /// number of `$n` slots in the rewritten query.
    pub fn n_params(&self) -> usize {
        self.formats.len()
    }

    fn order_params<'a>(&self, params: &Params<'a>) -> Result<Vec<&'a dyn SqlValue>, Error> {
        match (&self.order, params) {
            (Order::Positional(0), Params::None) => Ok(Vec::new()),
            (Order::Positional(n), Params::None) => Err(count_error(*n, 0)),
            (Order::Positional(n), Params::Positional(given)) => {
                if given.len() != *n {
                    return Err(count_error(*n, given.len()));
                }
                Ok(given.to_vec())
            }
            (Order::Positional(_), Params::Named(_)) => Err(ProgrammingError::new(
                "the query uses positional placeholders but a mapping was supplied",
            )
            .into()),
            (Order::Named(names), Params::Named(given)) => {
                let mut out = Vec::with_capacity(names.len());
                let mut missing = Vec::new();
                for name in names {
                    match given.iter().find(|(k, _)| k == name) {
                        Some((_, v)) => out.push(*v),
                        None => missing.push(name.as_str()),
                    }
                }
                if !missing.is_empty() {
                    return Err(ProgrammingError::new(format!(
                        "query parameter missing: {}",
                        missing.join(", ")
                    ))
                    .into());
                }
                Ok(out)
            }
            (Order::Named(_), _) => Err(ProgrammingError::new(
                "the query uses named placeholders but a sequence was supplied",
            )
            .into()),
        }
    }
}

fn placeholder_format(f: u8) -> ParamFormat {
    match f {
        b'b' => ParamFormat::Binary,
        b't' => ParamFormat::Text,
        _ => ParamFormat::Auto,
    }
}

#[cold]
fn scan_error(what: &str, offset: usize) -> Error {
    ProgrammingError::new(format!("{what} (at byte {offset})")).into()
}

#[cold]
fn mix_error() -> Error {
    ProgrammingError::new("positional and named placeholders cannot be mixed").into()
}

#[cold]
fn count_error(expected: usize, got: usize) -> Error {
    ProgrammingError::new(format!(
        "the query has {expected} placeholders but {got} parameters were passed"
    ))
    .into()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn tx() -> Transformer {
        let adapters = Arc::new(crate::adapt::AdaptersMap::layer(
            &crate::adapt::global_adapters().read().unwrap(),
        ));
        Transformer::new(crate::adapt::AdaptContext {
            adapters,
            encoding: None,
            timezone: None,
        })
    }

    #[test]
    fn positional_rewrite() {
        let q = ParsedQuery::parse(b"select %s, %b, %t").unwrap();
        assert_eq!(&q.rewritten[..], b"select $1, $2, $3");
        assert_eq!(q.n_params(), 3);
    }

    #[test]
    fn escaped_percent() {
        let q = ParsedQuery::parse(b"select '%%' || %s").unwrap();
        assert_eq!(&q.rewritten[..], b"select '%' || $1");
        assert_eq!(q.n_params(), 1);
    }

    #[test]
    fn placeholders_at_edges() {
        let q = ParsedQuery::parse(b"%s%s").unwrap();
        assert_eq!(&q.rewritten[..], b"$1$2");
    }

    #[test]
    fn named_placeholders_dedupe() {
        let q = ParsedQuery::parse(b"select %(a)s, %(b)s, %(a)s").unwrap();
        assert_eq!(&q.rewritten[..], b"select $1, $2, $1");
        assert_eq!(q.n_params(), 2);
    }

    #[test]
    fn percent_space_is_diagnosed() {
        let err = ParsedQuery::parse(b"select 100 % 7").unwrap_err();
        assert!(err.to_string().contains("did you mean %%?"));
    }

    #[test]
    fn unterminated_name() {
        assert!(ParsedQuery::parse(b"select %(name").is_err());
    }

    #[test]
    fn mixing_is_rejected() {
        assert!(ParsedQuery::parse(b"select %s, %(a)s").is_err());
        assert!(ParsedQuery::parse(b"select %(a)s, %s").is_err());
    }

    #[test]
    fn convert_dumps_params() {
        let mut tx = tx();
        let one = 1i64;
        let foo = "foo".to_string();
        let params: Vec<&dyn SqlValue> = vec![&one, &foo];
        let q = PostgresQuery::convert("select %s, %s", Params::Positional(&params), &mut tx).unwrap();
        assert_eq!(&q.query[..], b"select $1, $2");
        assert_eq!(q.params.len(), 2);
        assert_eq!(q.types.len(), 2);
        assert_eq!(q.formats.len(), 2);
    }

    #[test]
    fn convert_checks_counts() {
        let mut tx = tx();
        let one = 1i64;
        let params: Vec<&dyn SqlValue> = vec![&one];
        let err = PostgresQuery::convert("select %s, %s", Params::Positional(&params), &mut tx).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Programming);
    }

    #[test]
    fn named_missing_keys_are_listed() {
        let mut tx = tx();
        let one = 1i64;
        let given: Vec<(&str, &dyn SqlValue)> = vec![("a", &one)];
        let err =
            PostgresQuery::convert("select %(a)s, %(b)s, %(c)s", Params::Named(&given), &mut tx).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('b') && msg.contains('c'));
    }

    #[test]
    fn sequence_for_named_is_rejected() {
        let mut tx = tx();
        let one = 1i64;
        let params: Vec<&dyn SqlValue> = vec![&one];
        let err =
            PostgresQuery::convert("select %(a)s", Params::Positional(&params), &mut tx).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Programming);
    }
}
