use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use tracing::{debug, info, warn};

use iapd_core::models::FirmRecord;
use iapd_core::schema::{self, STAGE1_COLUMNS};
use iapd_core::utils::normalize_date;
use iapd_core::PipelineError;

/// **Firm Extractor**
///
/// Streams the decoded daily feed with a pull parser and projects each
/// `<Firm>` subtree into a [`FirmRecord`], writing stage-1 rows as it goes.
/// The document is never loaded whole. An element with a malformed attribute
/// is logged and skipped, leaving its fields empty like any other missing
/// attribute; the firm itself is still emitted unless it ends up without a
/// CRD number. A structural error aborts the stage with `XmlParseFatal`.
pub struct FirmExtractor {
    index_limit: Option<usize>,
}

impl FirmExtractor {
    pub fn new(index_limit: Option<usize>) -> Self {
        Self { index_limit }
    }

    /// Parse `xml_path` and write the stage-1 CSV. Returns the number of
    /// firms emitted.
    pub fn extract(
        &self,
        xml_path: &Path,
        output_path: &Path,
        date_added: &str,
    ) -> Result<u32, PipelineError> {
        let mut reader = Reader::from_file(xml_path).map_err(|e| PipelineError::XmlParseFatal {
            path: xml_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut writer = schema::create_csv_with_header(output_path, &STAGE1_COLUMNS)?;
        let mut buf = Vec::new();
        let mut count: u32 = 0;
        let mut skipped: u32 = 0;
        let mut current: Option<FirmRecord> = None;
        let mut main_addr_seen = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref element)) | Ok(Event::Empty(ref element)) => {
                    if element.name().as_ref() == b"Firm" {
                        current = Some(FirmRecord::default());
                        main_addr_seen = false;
                    } else if let Some(record) = current.as_mut() {
                        if let Err(err) =
                            project_element(record, element, &mut main_addr_seen)
                        {
                            warn!(
                                "Skipping malformed <{}> element: {}",
                                String::from_utf8_lossy(element.name().as_ref()),
                                err
                            );
                        }
                    }
                }
                Ok(Event::End(ref element)) if element.name().as_ref() == b"Firm" => {
                    if let Some(firm) = current.take() {
                        if firm.firm_crd_number.is_empty() {
                            warn!("Skipping firm without a CRD number");
                            skipped += 1;
                        } else {
                            writer.write_record(firm.to_stage1_record(date_added))?;
                            count += 1;
                            if self
                                .index_limit
                                .is_some_and(|limit| count as usize >= limit)
                            {
                                debug!("index_limit {} reached, stopping extraction", count);
                                break;
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(PipelineError::XmlParseFatal {
                        path: xml_path.to_path_buf(),
                        reason: err.to_string(),
                    });
                }
            }
            buf.clear();
        }

        schema::finish_csv(writer)?;
        info!(
            "Extracted {} firms from {} ({} skipped)",
            count,
            xml_path.display(),
            skipped
        );
        Ok(count)
    }
}

/// Copy the attributes of one child element onto the record under
/// construction. Only the first well-formed `MainAddr` of a firm is
/// projected. Attributes are decoded before anything is assigned, so a
/// malformed element leaves every field it would have set at its default.
fn project_element(
    record: &mut FirmRecord,
    element: &BytesStart<'_>,
    main_addr_seen: &mut bool,
) -> Result<(), String> {
    let name = element.name();
    match name.as_ref() {
        b"Info" | b"Rgstn" | b"Filing" | b"Item5A" | b"Item5F" => {}
        b"MainAddr" => {
            if *main_addr_seen {
                return Ok(());
            }
        }
        _ => return Ok(()),
    }

    let mut values: Vec<(Vec<u8>, String)> = Vec::new();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|err| err.to_string())?;
        let value = attribute
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        values.push((attribute.key.as_ref().to_vec(), value));
    }
    if name.as_ref() == b"MainAddr" {
        *main_addr_seen = true;
    }

    for (key, value) in values {
        assign_field(record, name.as_ref(), &key, value);
    }
    Ok(())
}

fn assign_field(record: &mut FirmRecord, element: &[u8], key: &[u8], value: String) {
    match element {
        b"Info" => match key {
            b"SECRgnCD" => record.sec_region_code = value,
            b"FirmCrdNb" => record.firm_crd_number = value,
            b"SECNb" => record.sec_number = value,
            b"SECMb" => record.sec_member_flag = value,
            b"BusNm" => record.business_name = value,
            b"LegalNm" => record.legal_name = value,
            _ => {}
        },
        b"MainAddr" => match key {
            b"Strt1" => record.street1 = value,
            b"Strt2" => record.street2 = value,
            b"City" => record.city = value,
            b"State" => record.state = value,
            b"Cntry" => record.country = value,
            b"PostlCd" => record.postal_code = value,
            b"PhNb" => record.phone = value,
            b"FaxNb" => record.fax = value,
            _ => {}
        },
        b"Rgstn" => match key {
            b"FirmType" => record.firm_type = value,
            b"St" => record.registration_state = value,
            // Registration date passes through unchanged.
            b"Dt" => record.registration_date = value,
            _ => {}
        },
        b"Filing" => match key {
            b"Dt" => record.filing_date = normalize_date(&value),
            b"FormVrsn" => record.filing_version = value,
            _ => {}
        },
        b"Item5A" => {
            if key == b"TtlEmp" {
                record.total_employees = value;
            }
        }
        b"Item5F" => match key {
            b"Q5F2C" => record.aum = value,
            b"Q5F2F" => record.total_accounts = value,
            _ => {}
        },
        _ => {}
    }
}
