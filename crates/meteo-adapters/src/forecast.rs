use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use meteo_core::{fingerprint, ForecastRecord, FORECAST_SOURCE_ID};

use crate::text::translate_conditions;
use crate::{local_name, AdapterContext, EntryError, ParsedForecasts, SourceAdapter, ValidationError};

const FORMAT: &str = "XML";

/// Parser for the ANM city forecast document (`<localitate>` / `<prognoza>`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnmForecastAdapter;

impl SourceAdapter for AnmForecastAdapter {
    type Record = ForecastRecord;

    fn source_id(&self) -> &'static str {
        FORECAST_SOURCE_ID
    }

    fn parse(&self, payload: &[u8], ctx: &AdapterContext) -> Result<ParsedForecasts, ValidationError> {
        check_envelope(payload)?;
        let locations = read_locations(payload)?;

        let mut batch = ParsedForecasts::default();
        for location in &locations {
            for day in &location.days {
                match day.to_record(location, ctx) {
                    Ok(record) => batch.accept(record),
                    Err(err) => {
                        warn!(
                            city = %location.name,
                            forecast_date = day.date.as_deref().unwrap_or(""),
                            error = %err,
                            "discarding forecast entry"
                        );
                        batch.reject();
                    }
                }
            }
        }

        debug!(
            locations = locations.len(),
            valid = batch.valid,
            total = batch.total,
            "forecast document parsed"
        );
        Ok(batch)
    }
}

fn check_envelope(payload: &[u8]) -> Result<(), ValidationError> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    if !trimmed.starts_with('<') && !text.contains("<?xml") {
        return Err(ValidationError::NotXml);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Location {
    name: String,
    data_date: Option<String>,
    days: Vec<DayDraft>,
}

#[derive(Debug, Default)]
struct DayDraft {
    date: Option<String>,
    temp_min: Option<String>,
    temp_max: Option<String>,
    description: Option<String>,
    symbol: Option<String>,
}

impl DayDraft {
    fn to_record(&self, location: &Location, ctx: &AdapterContext) -> Result<ForecastRecord, EntryError> {
        let forecast_date = required(&self.date, "data")?;
        let temp_min = integer(required(&self.temp_min, "temp_min")?, "temp_min")?;
        let temp_max = integer(required(&self.temp_max, "temp_max")?, "temp_max")?;
        let raw_conditions = self.description.as_deref().unwrap_or("");

        let content_hash = fingerprint(&[
            &location.name,
            forecast_date,
            &temp_min.to_string(),
            &temp_max.to_string(),
            raw_conditions,
        ]);

        Ok(ForecastRecord {
            city: location.name.clone(),
            forecast_date: forecast_date.to_string(),
            data_date: location.data_date.clone().unwrap_or_default(),
            temp_min,
            temp_max,
            conditions: translate_conditions(raw_conditions),
            conditions_code: self.symbol.clone().unwrap_or_default(),
            source_url: ctx.source_url.clone(),
            content_hash,
            fetched_at: ctx.fetched_at,
        })
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, EntryError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(EntryError::MissingField(field)),
    }
}

fn integer(value: &str, field: &'static str) -> Result<i32, EntryError> {
    value.trim().parse::<i32>().map_err(|_| EntryError::NotInteger {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    DataDate,
    TempMin,
    TempMax,
    Description,
    Symbol,
}

impl Field {
    fn for_location_child(local: &[u8]) -> Option<Self> {
        (local == b"DataPrognozei").then_some(Field::DataDate)
    }

    fn for_day_child(local: &[u8]) -> Option<Self> {
        match local {
            b"temp_min" => Some(Field::TempMin),
            b"temp_max" => Some(Field::TempMax),
            b"fenomen_descriere" => Some(Field::Description),
            b"fenomen_simbol" => Some(Field::Symbol),
            _ => None,
        }
    }
}

struct OpenLocation {
    depth: usize,
    slot: usize,
    location: Location,
}

struct Capture {
    depth: usize,
    field: Field,
    text: String,
}

/// Walks the whole document before any record is built, so a structural
/// error rejects the payload instead of yielding a truncated batch.
#[derive(Default)]
struct ForecastWalker {
    depth: usize,
    saw_root: bool,
    root_closed: bool,
    slots: Vec<Option<Location>>,
    open: Vec<OpenLocation>,
    day: Option<(usize, DayDraft)>,
    capture: Option<Capture>,
}

impl ForecastWalker {
    fn open_element(&mut self, e: &BytesStart<'_>, depth: usize) -> Result<(), ValidationError> {
        self.saw_root = true;
        let qname = e.name();
        let local = local_name(qname.as_ref());

        if local == b"localitate" {
            let name = attribute(e, b"nume")?.unwrap_or_default().trim().to_string();
            let slot = self.slots.len();
            self.slots.push(None);
            self.open.push(OpenLocation {
                depth,
                slot,
                location: Location {
                    name,
                    ..Location::default()
                },
            });
            return Ok(());
        }

        if let Some((day_depth, _)) = &self.day {
            if depth == day_depth + 1 {
                if let Some(field) = Field::for_day_child(local) {
                    self.capture = Some(Capture {
                        depth,
                        field,
                        text: String::new(),
                    });
                }
            }
            return Ok(());
        }

        let Some(loc_depth) = self.open.last().map(|l| l.depth) else {
            return Ok(());
        };
        if depth != loc_depth + 1 {
            return Ok(());
        }
        if local == b"prognoza" {
            let date = attribute(e, b"data")?;
            self.day = Some((
                depth,
                DayDraft {
                    date,
                    ..DayDraft::default()
                },
            ));
        } else if let Some(field) = Field::for_location_child(local) {
            self.capture = Some(Capture {
                depth,
                field,
                text: String::new(),
            });
        }
        Ok(())
    }

    fn close_element(&mut self, depth: usize) {
        if self.capture.as_ref().is_some_and(|c| c.depth == depth) {
            if let Some(capture) = self.capture.take() {
                self.store_field(capture.field, capture.text);
            }
            return;
        }
        if self.day.as_ref().is_some_and(|(d, _)| *d == depth) {
            if let (Some((_, day)), Some(open)) = (self.day.take(), self.open.last_mut()) {
                open.location.days.push(day);
            }
            return;
        }
        if self.open.last().is_some_and(|l| l.depth == depth) {
            if let Some(done) = self.open.pop() {
                if !done.location.name.is_empty() {
                    self.slots[done.slot] = Some(done.location);
                }
            }
        }
    }

    /// Anything but whitespace after the root element closes is junk.
    fn reject_trailing(&self, content: bool) -> Result<(), ValidationError> {
        if self.root_closed && content {
            return Err(malformed("junk after document element"));
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if let Some(capture) = self.capture.as_mut() {
            if capture.depth == self.depth {
                capture.text.push_str(text);
            }
        }
    }

    /// First occurrence wins, matching a `findtext` lookup.
    fn store_field(&mut self, field: Field, text: String) {
        let target = match field {
            Field::DataDate => self.open.last_mut().map(|open| &mut open.location.data_date),
            Field::TempMin => self.day.as_mut().map(|(_, day)| &mut day.temp_min),
            Field::TempMax => self.day.as_mut().map(|(_, day)| &mut day.temp_max),
            Field::Description => self.day.as_mut().map(|(_, day)| &mut day.description),
            Field::Symbol => self.day.as_mut().map(|(_, day)| &mut day.symbol),
        };
        if let Some(slot) = target {
            if slot.is_none() {
                *slot = Some(text);
            }
        }
    }

    fn finish(self) -> Result<Vec<Location>, ValidationError> {
        if !self.saw_root {
            return Err(malformed("no element found"));
        }
        if self.depth != 0 {
            return Err(malformed("unexpected end of document"));
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

fn read_locations(payload: &[u8]) -> Result<Vec<Location>, ValidationError> {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);

    let mut walker = ForecastWalker::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                walker.reject_trailing(true)?;
                walker.depth += 1;
                let depth = walker.depth;
                walker.open_element(e, depth)?;
            }
            Ok(Event::Empty(ref e)) => {
                walker.reject_trailing(true)?;
                let depth = walker.depth + 1;
                walker.open_element(e, depth)?;
                walker.close_element(depth);
                walker.root_closed |= walker.depth == 0;
            }
            Ok(Event::End(_)) => {
                let depth = walker.depth;
                walker.close_element(depth);
                walker.depth = walker.depth.saturating_sub(1);
                walker.root_closed |= walker.depth == 0;
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|err| malformed(err.to_string()))?;
                walker.reject_trailing(!text.trim().is_empty())?;
                walker.text(&text);
            }
            Ok(Event::CData(e)) => {
                walker.reject_trailing(true)?;
                let raw = e.into_inner();
                walker.text(&String::from_utf8_lossy(&raw));
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(malformed(format!(
                    "{err} at position {}",
                    reader.error_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    walker.finish()
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ValidationError> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| malformed(err.to_string()))?;
    match attr {
        Some(attr) => {
            let value = attr
                .unescape_value()
                .map_err(|err| malformed(err.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn malformed(detail: impl Into<String>) -> ValidationError {
    ValidationError::Malformed {
        format: FORMAT,
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use meteo_core::DataQuality;
    use uuid::Uuid;

    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::new_v4(), "http://anm.test/prognoza-orase-xml.php")
    }

    fn parse(xml: &str) -> Result<ParsedForecasts, ValidationError> {
        AnmForecastAdapter.parse(xml.as_bytes(), &ctx())
    }

    #[test]
    fn reads_locations_and_days() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <Prognoza_Oraselor>
              <localitate nume=" Cluj-Napoca ">
                <prognoza data="2026-01-16">
                  <temp_min>-4</temp_min>
                  <temp_max> 3 </temp_max>
                  <fenomen_descriere>Cer variabil</fenomen_descriere>
                  <fenomen_simbol>2</fenomen_simbol>
                </prognoza>
                <prognoza data="2026-01-17">
                  <temp_min>-2</temp_min>
                  <temp_max>5</temp_max>
                  <fenomen_descriere>Ninsoare slaba</fenomen_descriere>
                </prognoza>
                <DataPrognozei>2026-01-15</DataPrognozei>
              </localitate>
            </Prognoza_Oraselor>"#;

        let batch = parse(xml).unwrap();
        assert_eq!((batch.valid, batch.total), (2, 2));
        assert_eq!(batch.quality(), DataQuality::Valid);

        let first = &batch.records[0];
        assert_eq!(first.city, "Cluj-Napoca");
        assert_eq!(first.forecast_date, "2026-01-16");
        assert_eq!(first.data_date, "2026-01-15");
        assert_eq!((first.temp_min, first.temp_max), (-4, 3));
        assert_eq!(first.conditions, "Partly Cloudy");
        assert_eq!(first.conditions_code, "2");
        assert_eq!(
            first.content_hash,
            fingerprint(&["Cluj-Napoca", "2026-01-16", "-4", "3", "Cer variabil"])
        );

        let second = &batch.records[1];
        assert_eq!(second.conditions, "Light Snow, Snow");
        assert_eq!(second.conditions_code, "");
        assert_eq!(second.data_date, "2026-01-15");
    }

    #[test]
    fn unnamed_locations_are_not_counted() {
        let xml = r#"<root>
              <localitate nume="">
                <prognoza data="2026-01-16"><temp_min>1</temp_min><temp_max>2</temp_max></prognoza>
              </localitate>
              <localitate>
                <prognoza data="2026-01-16"><temp_min>1</temp_min><temp_max>2</temp_max></prognoza>
              </localitate>
              <group>
                <localitate nume="Sibiu">
                  <prognoza data="2026-01-16"><temp_min>1</temp_min><temp_max>2</temp_max></prognoza>
                </localitate>
              </group>
            </root>"#;

        let batch = parse(xml).unwrap();
        assert_eq!((batch.valid, batch.total), (1, 1));
        assert_eq!(batch.records[0].city, "Sibiu");
        assert_eq!(batch.records[0].conditions, "Unknown");
    }

    #[test]
    fn bad_entries_are_counted_but_discarded() {
        let xml = r#"<root><localitate nume="Arad">
              <prognoza data="2026-01-16"><temp_min>1</temp_min><temp_max>4</temp_max></prognoza>
              <prognoza data="2026-01-17"><temp_min>n/a</temp_min><temp_max>4</temp_max></prognoza>
              <prognoza><temp_min>1</temp_min><temp_max>4</temp_max></prognoza>
              <prognoza data="2026-01-19"><temp_min>1</temp_min><temp_max/></prognoza>
              <prognoza data="2026-01-20"/>
            </localitate></root>"#;

        let batch = parse(xml).unwrap();
        assert_eq!((batch.valid, batch.total), (1, 5));
        assert_eq!(batch.quality(), DataQuality::Invalid);
    }

    #[test]
    fn rejects_empty_and_non_xml_payloads() {
        assert_eq!(parse("   \n").unwrap_err(), ValidationError::EmptyPayload);
        assert_eq!(parse("Service Unavailable").unwrap_err(), ValidationError::NotXml);
    }

    #[test]
    fn structural_errors_reject_the_whole_payload() {
        let truncated = r#"<root><localitate nume="Arad"><prognoza data="2026-01-16">"#;
        assert!(matches!(
            parse(truncated).unwrap_err(),
            ValidationError::Malformed { format: "XML", .. }
        ));

        let mismatched = r#"<root><localitate nume="Arad"></prognoza></root>"#;
        assert!(matches!(
            parse(mismatched).unwrap_err(),
            ValidationError::Malformed { .. }
        ));
    }

    #[test]
    fn content_after_the_root_element_is_rejected() {
        let body = r#"<root><localitate nume="Arad">
              <prognoza data="2026-01-16"><temp_min>1</temp_min><temp_max>4</temp_max></prognoza>
            </localitate></root>"#;
        assert_eq!(parse(body).unwrap().valid, 1);

        for trailing in ["<root2/>", "<root2></root2>", "trailing junk", "<![CDATA[x]]>"] {
            let err = parse(&format!("{body}{trailing}")).unwrap_err();
            assert_eq!(
                err,
                ValidationError::Malformed {
                    format: "XML",
                    detail: "junk after document element".to_string(),
                },
                "{trailing}"
            );
        }

        let tolerated = format!("{body}\n  <!-- generated -->\n");
        assert_eq!(parse(&tolerated).unwrap().valid, 1);
    }

    #[test]
    fn document_without_locations_is_empty_not_an_error() {
        let batch = parse("<Prognoza_Oraselor/>").unwrap();
        assert_eq!((batch.valid, batch.total), (0, 0));
        assert_eq!(batch.quality(), DataQuality::Unavailable);
    }
}
