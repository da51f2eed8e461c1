//! XML response rendering for the public XML surface.
//!
//! The XML API mirrors the S3 dialect: bucket listings are rendered as
//! `<ListBucketResult>` documents.  Media downloads stream raw bytes and
//! do not pass through here.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

use crate::backend::types::{Listing, ObjectMeta};

/// Render `<ListBucketResult>` for a bucket listing.
pub fn render_object_listing(bucket: &str, prefix: &str, delimiter: &str, listing: &Listing) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");

    let root = BytesStart::new("ListBucketResult")
        .with_attributes([("xmlns", "http://doc.s3.amazonaws.com/2006-03-01")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_element(&mut writer, "Name", bucket);
    write_element(&mut writer, "Prefix", prefix);
    write_element(&mut writer, "Delimiter", delimiter);
    write_element(&mut writer, "IsTruncated", "false");

    for object in &listing.objects {
        write_contents(&mut writer, object);
    }

    for common in &listing.prefixes {
        writer
            .write_event(Event::Start(BytesStart::new("CommonPrefixes")))
            .expect("start CommonPrefixes");
        write_element(&mut writer, "Prefix", common);
        writer
            .write_event(Event::End(BytesEnd::new("CommonPrefixes")))
            .expect("end CommonPrefixes");
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListBucketResult")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

fn write_contents(writer: &mut Writer<Cursor<Vec<u8>>>, object: &ObjectMeta) {
    writer
        .write_event(Event::Start(BytesStart::new("Contents")))
        .expect("start Contents");
    write_element(writer, "Key", &object.name);
    write_element(writer, "Generation", &object.generation.to_string());
    write_element(writer, "MetaGeneration", &object.metageneration.to_string());
    write_element(
        writer,
        "LastModified",
        &object.updated.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    write_element(writer, "ETag", &object.etag);
    write_element(writer, "Size", &object.size.to_string());
    writer
        .write_event(Event::End(BytesEnd::new("Contents")))
        .expect("end Contents");
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .expect("start element");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("element text");
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("end element");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::ObjectAttrs;
    use crate::checksum;

    fn listing() -> Listing {
        let digests = checksum::digest(b"hello");
        let meta = ObjectMeta::new("b", "greeting.txt", &ObjectAttrs::default(), &digests, 17);
        Listing {
            objects: vec![meta],
            prefixes: vec!["photos/".to_string()],
        }
    }

    #[test]
    fn listing_renders_contents_and_prefixes() {
        let xml = render_object_listing("b", "", "/", &listing());

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<ListBucketResult"));
        assert!(xml.contains("<Name>b</Name>"));
        assert!(xml.contains("<Key>greeting.txt</Key>"));
        assert!(xml.contains("<Generation>17</Generation>"));
        assert!(xml.contains("<Size>5</Size>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>photos/</Prefix></CommonPrefixes>"));
    }

    #[test]
    fn listing_escapes_markup_in_names() {
        let digests = checksum::digest(b"x");
        let meta = ObjectMeta::new("b", "a<b>&c", &ObjectAttrs::default(), &digests, 1);
        let listing = Listing {
            objects: vec![meta],
            prefixes: vec![],
        };
        let xml = render_object_listing("b", "", "", &listing);
        assert!(xml.contains("<Key>a&lt;b&gt;&amp;c</Key>"));
    }
}
