//! Parsers for the header lines of a CGI/1.1 response

use crate::cgi::{CgiHeader, Location, Status};

use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_till, take_while_m_n};
use nom::character::complete::space0;
use nom::character::is_digit;
use nom::combinator::{map, map_res};
use nom::sequence::tuple;
use nom::IResult;

use std::str;

fn cr_or_lf(x: u8) -> bool {
    x == b'\n' || x == b'\r'
}

fn text(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till(cr_or_lf)(input)
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        map_res(take_while_m_n(3, 3, is_digit), str::from_utf8),
        |digits: &str| digits.parse::<u16>()
    )(input)
}

pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    map(
        tuple((tag_no_case("Status:"), space0, code, space0, text)),
        |(_, _, code, _, phrase)| Status {
            code: code,
            reason_phrase: Vec::from(phrase)
        }
    )(input)
}

pub fn location(input: &[u8]) -> IResult<&[u8], Location> {
    map(
        tuple((tag_no_case("Location:"), space0, text)),
        |(_, _, uri)| Location { url: Vec::from(uri) }
    )(input)
}

fn content_length(input: &[u8]) -> IResult<&[u8], ()> {
    map(tag_no_case("Content-length:"), |_| ())(input)
}

/// Sorts one header line from a CGI program into the kinds the server
/// treats specially.
pub fn cgi_header(line: &[u8]) -> CgiHeader {
    let mut special = alt((
        map(status, CgiHeader::Status),
        map(tag_no_case("Status:"), |_| CgiHeader::BadStatus),
        map(location, CgiHeader::Location),
        map(content_length, |_| CgiHeader::ContentLength)
    ));

    let result: IResult<&[u8], CgiHeader> = special(line);
    match result {
        Ok((_, header)) => header,
        Err(_) => CgiHeader::Other
    }
}

/// A line that is empty or starts with white space ends the header block.
pub fn is_end_of_headers(line: &[u8]) -> bool {
    line.first().map_or(true, |b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_works() {
        match cgi_header(b"Status: 404 Not Found\r\n") {
            CgiHeader::Status(s) => {
                assert_eq!(s.code, 404);
                assert_eq!(s.reason_phrase, b"Not Found");
                assert_eq!(s.line(), "404 Not Found");
            },
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn status_is_case_insensitive_and_phrase_optional() {
        match cgi_header(b"STATUS:201\n") {
            CgiHeader::Status(s) => {
                assert_eq!(s.code, 201);
                assert_eq!(s.line(), "201");
            },
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn status_without_code_is_rejected() {
        assert_eq!(cgi_header(b"Status: fine thanks\r\n"), CgiHeader::BadStatus);
        assert_eq!(cgi_header(b"Status: 20\r\n"), CgiHeader::BadStatus);
    }

    #[test]
    fn location_works() {
        match cgi_header(b"location:   /elsewhere?x=1\r\n") {
            CgiHeader::Location(l) => assert_eq!(l.url, b"/elsewhere?x=1"),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn content_length_is_noticed() {
        assert_eq!(cgi_header(b"Content-Length: 12\r\n"), CgiHeader::ContentLength);
        assert_eq!(cgi_header(b"content-length:12\n"), CgiHeader::ContentLength);
    }

    #[test]
    fn everything_else_passes() {
        assert_eq!(cgi_header(b"Content-Type: text/html; charset=utf-8\r\n"),
                   CgiHeader::Other);
        assert_eq!(cgi_header(b"X-Statusy: 1\r\n"), CgiHeader::Other);
        assert_eq!(cgi_header(b"garbage without a colon\r\n"), CgiHeader::Other);
    }

    #[test]
    fn header_block_ends_on_blank_lines() {
        assert!(is_end_of_headers(b"\r\n"));
        assert!(is_end_of_headers(b"\n"));
        assert!(is_end_of_headers(b""));
        assert!(!is_end_of_headers(b"Date: today\r\n"));
    }
}
