//! Folding Locations into their umbrella Company for one filing year.
//!
//! A company embryo accumulates child locations as they stream in,
//! tallying metrics and grouping identifying fields by NAICS code so
//! the finished Company represents its employee-dominant industry.

use std::collections::HashMap;

use wsi_common::metrics::recalc_derived;
use wsi_common::models::{Archive, Company, Industry, IndustryShare, Location, Metric};
use wsi_common::text::{char_count, tokenize_company};

/// Identifying fields grouped per NAICS code, first seen wins.
#[derive(Debug, Clone, Default)]
struct IndustryTally {
    annual_average_employees: f64,
    industry: Industry,
    ein: Option<String>,
    company_name: Option<String>,
    street_address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<u32>,
    establishment_id: Option<String>,
    establishment_type: Option<u32>,
    size: Option<u32>,
    created_timestamp: Option<String>,
}

/// A Company still accumulating its child Locations.
#[derive(Debug, Clone)]
pub struct CompanyEmbryo {
    pub company: Company,
    tallies: HashMap<u32, IndustryTally>,
}

impl CompanyEmbryo {
    pub fn new(place: String, year_filing_for: i32) -> Self {
        CompanyEmbryo {
            company: Company::new(place, year_filing_for),
            tallies: HashMap::new(),
        }
    }

    /// Fold one child location into the running totals.
    pub fn add_location(&mut self, loc: &Location) {
        let company = &mut self.company;
        company.num_locations += 1;

        if let Some(ein) = &loc.ein {
            if !company.eins.contains(ein) {
                company.eins.push(ein.clone());
            }
        }

        if company.year_filing_for == 0 {
            company.year_filing_for = loc.year_filing_for;
        }

        if let Some(code) = loc.industry.as_ref().and_then(|i| i.naics_code) {
            let tally = self.tallies.entry(code).or_default();
            tally.annual_average_employees += loc.annual_average_employees;
            if tally.industry.naics_code.is_none() {
                tally.industry = loc.industry.clone().unwrap_or_default();
            }
            tally.ein = tally.ein.take().or_else(|| loc.ein.clone());
            tally.company_name = tally
                .company_name
                .take()
                .or_else(|| Some(loc.company_name.clone()));
            tally.street_address = tally.street_address.take().or_else(|| loc.street_address.clone());
            tally.city = tally.city.take().or_else(|| loc.city.clone());
            tally.state = tally.state.take().or_else(|| loc.state.clone());
            tally.zip_code = tally.zip_code.take().or(loc.zip_code);
            if let Some(archive) = &loc.archive {
                tally.establishment_id = tally
                    .establishment_id
                    .take()
                    .or_else(|| archive.establishment_id.clone());
                tally.establishment_type =
                    tally.establishment_type.take().or(archive.establishment_type);
                tally.size = tally.size.take().or(archive.size);
                tally.created_timestamp = tally
                    .created_timestamp
                    .take()
                    .or_else(|| archive.created_timestamp.clone());
            }
        }

        if let Some(archive) = &loc.archive {
            let company_archive = company.archive.get_or_insert_with(Archive::default);
            if let Some(n) = archive.no_injuries_illnesses {
                company_archive.no_injuries_illnesses =
                    Some(company_archive.no_injuries_illnesses.unwrap_or(0.0) + n);
            }
            if let Some(n) = archive.total_other_cases {
                company_archive.total_other_cases =
                    Some(company_archive.total_other_cases.unwrap_or(0.0) + n);
            }
        }

        company.annual_average_employees += loc.annual_average_employees;
        company.total_hours_worked += loc.total_hours_worked;
        company.metrics.add_all(&loc.metrics);
    }

    /// Close out the totals: pick the dominant industry, fill in the
    /// representative metadata and derived metrics, and return the
    /// finished Company.
    pub fn finalize(mut self) -> Company {
        let company = &mut self.company;

        if !self.tallies.is_empty() {
            let mut sorted: Vec<IndustryTally> = self.tallies.into_values().collect();
            sorted.sort_by(|a, b| {
                b.annual_average_employees
                    .partial_cmp(&a.annual_average_employees)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            company.industry = Some(sorted[0].industry.clone());
            company.industries = sorted
                .iter()
                .map(|t| IndustryShare {
                    naics_code: t.industry.naics_code,
                    caption: t.industry.caption.clone(),
                    annual_average_employees: t.annual_average_employees,
                })
                .collect();

            let top = &sorted[0];
            company.ein = top.ein.clone();
            if let Some(name) = &top.company_name {
                company.company_name = name.clone();
            }
            company.street_address = top.street_address.clone();
            company.city = top.city.clone();
            company.state = top.state.clone();
            company.zip_code = top.zip_code;

            let archive = company.archive.get_or_insert_with(Archive::default);
            archive.establishment_id = top.establishment_id.clone();
            archive.establishment_type = top.establishment_type;
            archive.size = top.size;
            archive.created_timestamp = top.created_timestamp.clone();
        }

        if company.archive.as_ref().is_some_and(Archive::is_empty) {
            company.archive = None;
        }

        for m in Metric::ALL {
            let avg = if company.num_locations > 0 {
                company.metrics.get(m) / company.num_locations as f64
            } else {
                0.0
            };
            company.averages_per_loc.set(m, avg);
        }

        recalc_derived(&mut company.metrics, company.total_hours_worked);
        company.avg_work_week = wsi_common::metrics::avg_work_week(
            company.total_hours_worked,
            company.annual_average_employees,
        );

        company.tokenized = tokenize_company(company);
        company.tokenized_company_name =
            wsi_common::text::tokenize_string(&company.company_name);
        company.char_count = char_count(&company.company_name);

        self.company
    }
}

/// First-time popularity from size; never reduces an existing value.
pub fn popularity(existing: f64, annual_average_employees: f64) -> f64 {
    let computed = annual_average_employees.max(1.0).log10() * 10.0;
    existing.max(computed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(name: &str, naics: Option<u32>, employees: f64, hours: f64, injuries: f64) -> Location {
        let mut l = Location::new();
        l.company_name = name.into();
        l.annual_average_employees = employees;
        l.total_hours_worked = hours;
        l.metrics.total_injuries = injuries;
        l.metrics.total_incidents = injuries;
        l.year_filing_for = 2022;
        if let Some(code) = naics {
            l.industry = Some(Industry {
                naics_code: Some(code),
                caption: Some(format!("industry {code}")),
            });
        }
        l
    }

    #[test]
    fn dominant_industry_is_employee_weighted() {
        let mut embryo = CompanyEmbryo::new("acme".into(), 2022);
        embryo.add_location(&loc("Acme", Some(11), 10.0, 20_000.0, 1.0));
        embryo.add_location(&loc("Acme", Some(22), 300.0, 600_000.0, 2.0));
        embryo.add_location(&loc("Acme", Some(11), 20.0, 40_000.0, 0.0));
        let company = embryo.finalize();
        assert_eq!(company.industry.unwrap().naics_code, Some(22));
        assert_eq!(company.industries.len(), 2);
        assert_eq!(company.industries[0].annual_average_employees, 300.0);
        assert_eq!(company.num_locations, 3);
    }

    #[test]
    fn sums_and_averages_per_location() {
        let mut embryo = CompanyEmbryo::new("acme".into(), 2022);
        embryo.add_location(&loc("Acme", Some(11), 50.0, 100_000.0, 3.0));
        embryo.add_location(&loc("Acme", Some(11), 50.0, 100_000.0, 1.0));
        let company = embryo.finalize();
        assert_eq!(company.annual_average_employees, 100.0);
        assert_eq!(company.total_hours_worked, 200_000.0);
        assert_eq!(company.metrics.total_injuries, 4.0);
        assert_eq!(company.averages_per_loc.total_injuries, 2.0);
        // TRIR over the summed hours: 4 * 200_000 / 200_000.
        assert!((company.metrics.trir - 4.0).abs() < 1e-9);
    }

    #[test]
    fn distinct_eins_are_collected() {
        let mut embryo = CompanyEmbryo::new("acme".into(), 2022);
        let mut a = loc("Acme", Some(11), 1.0, 2000.0, 0.0);
        a.ein = Some("12-111".into());
        let mut b = loc("Acme", Some(11), 1.0, 2000.0, 0.0);
        b.ein = Some("12-222".into());
        let mut c = loc("Acme", Some(11), 1.0, 2000.0, 0.0);
        c.ein = Some("12-111".into());
        embryo.add_location(&a);
        embryo.add_location(&b);
        embryo.add_location(&c);
        assert_eq!(embryo.company.eins.len(), 2);
    }

    #[test]
    fn archive_counters_sum_across_locations() {
        let mut embryo = CompanyEmbryo::new("acme".into(), 2022);
        let mut a = loc("Acme", None, 1.0, 2000.0, 0.0);
        a.archive = Some(Archive {
            no_injuries_illnesses: Some(1.0),
            total_other_cases: Some(2.0),
            ..Archive::default()
        });
        let mut b = loc("Acme", None, 1.0, 2000.0, 0.0);
        b.archive = Some(Archive {
            no_injuries_illnesses: Some(1.0),
            ..Archive::default()
        });
        embryo.add_location(&a);
        embryo.add_location(&b);
        let company = embryo.finalize();
        let archive = company.archive.unwrap();
        assert_eq!(archive.no_injuries_illnesses, Some(2.0));
        assert_eq!(archive.total_other_cases, Some(2.0));
    }

    #[test]
    fn popularity_never_decreases() {
        assert!((popularity(0.0, 1000.0) - 30.0).abs() < 1e-9);
        assert_eq!(popularity(45.0, 1000.0), 45.0);
        assert_eq!(popularity(0.0, 0.0), 0.0);
    }
}
