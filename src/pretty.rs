//! A small document algebra for rendering decompiled listings.
//!
//! Pared down from the usual combinator set: listings come out one statement
//! per line, so there is no flow fitting, only text, newlines and nesting.

use std::borrow::Cow;
use std::ops::{Add, AddAssign};

#[derive(Clone, Debug, PartialEq)]
pub enum Doc {
    Empty,
    Append(Box<Doc>, Box<Doc>),
    Nest(usize, Box<Doc>),
    Newline,
    Text(Cow<'static, str>),
}

pub fn empty() -> Doc {
    Doc::Empty
}

pub fn newline() -> Doc {
    Doc::Newline
}

pub fn nest(offset: usize, doc: Doc) -> Doc {
    doc.nest(offset)
}

pub fn doc<T: Into<Doc>>(data: T) -> Doc {
    data.into()
}

pub fn concat<I>(docs: I) -> Doc
where
    I: IntoIterator<Item = Doc>,
{
    docs.into_iter().fold(empty(), |a, b| a.append(b))
}

pub fn intersperse<I, S>(docs: I, sep: S) -> Doc
where
    I: IntoIterator<Item = Doc>,
    S: Into<Doc>,
{
    let sep = sep.into();
    let mut iter = docs.into_iter();
    if let Some(first) = iter.next() {
        let mut result = first;
        for next in iter {
            result += sep.clone() + next;
        }
        result
    } else {
        empty()
    }
}

impl<S> From<S> for Doc
where
    S: ToString,
{
    fn from(s: S) -> Doc {
        let text = s.to_string();
        debug_assert!(!text.contains(|c: char| c == '\n' || c == '\r'));
        Doc::Text(text.into())
    }
}

impl Doc {
    pub fn append(self, that: Doc) -> Doc {
        Doc::Append(self.into(), that.into())
    }

    pub fn nest(self, offset: usize) -> Doc {
        Doc::Nest(offset, self.into())
    }

    pub fn render_string(&self) -> String {
        let mut renderer = Renderer::default();
        renderer.render(self, 0);
        renderer.out
    }
}

impl<U: Into<Doc>> Add<U> for Doc {
    type Output = Doc;
    fn add(mut self, rhs: U) -> Doc {
        self.add_assign(rhs);
        self
    }
}

impl<U: Into<Doc>> AddAssign<U> for Doc {
    fn add_assign(&mut self, rhs: U) {
        let doc = std::mem::replace(self, empty());
        *self = doc.append(rhs.into());
    }
}

/// Indentation is written lazily so blank lines carry no trailing spaces.
#[derive(Default)]
struct Renderer {
    out: String,
    pending_indent: Option<usize>,
}

impl Renderer {
    fn render(&mut self, doc: &Doc, indent: usize) {
        match doc {
            Doc::Empty => {}
            Doc::Append(left, right) => {
                self.render(left, indent);
                self.render(right, indent);
            }
            Doc::Nest(offset, inner) => self.render(inner, indent + offset),
            Doc::Newline => {
                self.out.push('\n');
                self.pending_indent = Some(indent);
            }
            Doc::Text(text) => {
                if let Some(spaces) = self.pending_indent.take() {
                    for _ in 0..spaces {
                        self.out.push(' ');
                    }
                }
                self.out.push_str(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lines_indent() {
        let d = doc("a") + nest(4, newline() + "b" + newline() + "c") + newline() + "d";
        assert_eq!(d.render_string(), "a\n    b\n    c\nd");
    }

    #[test]
    fn blank_lines_have_no_trailing_spaces() {
        let d = doc("a") + nest(4, newline() + newline() + "b");
        assert_eq!(d.render_string(), "a\n\n    b");
    }

    #[test]
    fn intersperse_joins() {
        let d = intersperse(vec![doc("x"), doc("y"), doc("z")], ", ");
        assert_eq!(d.render_string(), "x, y, z");
    }
}
