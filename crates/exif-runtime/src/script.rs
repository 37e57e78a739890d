//! Perl programs evaluated by the guest.
//!
//! Programs work on the guest paths of the scratch slots (`/tmp/input` and
//! `/tmp/output` with the default mount) and print a single result to stdout.

/// Placeholder printed in place of binary tag values.
pub const BINARY_PLACEHOLDER: &str = "[binary data]";

/// Print the bundled ExifTool version.
pub const VERSION: &str = "use Image::ExifTool; print Image::ExifTool->VERSION;";

/// Extract all tags from the file at guest path `input` and print them as
/// one JSON object.
pub fn read_metadata(input: &str) -> String {
    format!(
        r#"
use Image::ExifTool;
use JSON::PP;
my $et = Image::ExifTool->new;
my $info = $et->ImageInfo('{input}');
my %result;
foreach my $tag (keys %$info) {{
    my $val = $$info{{$tag}};
    if (ref($val) eq 'SCALAR') {{
        $result{{$tag}} = '{BINARY_PLACEHOLDER}';
    }} else {{
        $result{{$tag}} = $val;
    }}
}}
print JSON::PP->new->utf8->encode(\%result);
"#,
        input = single_quoted(input),
    )
}

/// Apply the tags in `tags_json` to `input`, writing `output`, and print
/// `WriteInfo`'s result (`0`, `1` or `2`).
pub fn write_metadata(input: &str, output: &str, tags_json: &str) -> String {
    format!(
        r#"
use Image::ExifTool;
use JSON::PP;
my $et = Image::ExifTool->new;
my $tags = JSON::PP->new->utf8->decode('{tags}');
foreach my $tag (keys %$tags) {{
    $et->SetNewValue($tag, $tags->{{$tag}});
}}
my $result = $et->WriteInfo('{input}', '{output}');
print $result;
"#,
        tags = single_quoted(tags_json),
        input = single_quoted(input),
        output = single_quoted(output),
    )
}

/// Escape `text` for the body of a Perl single-quoted literal.
///
/// Only `\` and `'` are special there.
pub fn single_quoted(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
