// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! CSV loading of the base topology: stops, lines and the line-stop
//! connectivity rows the graph is built from.
//!
//! Field positions follow the operator's export format. Rows that fail to
//! parse are skipped with a warning; a file that cannot be opened at all is
//! an error, topology is mandatory at startup.

use crate::transit_graph::{ConnectivityTuple, Line, Stop};
use anyhow::Context;
use csv::StringRecord;
use log::warn;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub fn load_stops(path: &Path) -> anyhow::Result<Vec<Stop>> {
    let file =
        File::open(path).with_context(|| format!("opening stops file {}", path.display()))?;
    read_stops(file).with_context(|| format!("reading stops file {}", path.display()))
}

pub fn load_lines(path: &Path) -> anyhow::Result<Vec<Line>> {
    let file =
        File::open(path).with_context(|| format!("opening lines file {}", path.display()))?;
    read_lines(file).with_context(|| format!("reading lines file {}", path.display()))
}

pub fn load_linestops(path: &Path) -> anyhow::Result<Vec<ConnectivityTuple>> {
    let file =
        File::open(path).with_context(|| format!("opening linestops file {}", path.display()))?;
    read_linestops(file).with_context(|| format!("reading linestops file {}", path.display()))
}

/// Stops export: stop id, plan version, short name, long name, gps x,
/// gps y, decimal longitude, decimal latitude.
pub fn read_stops<R: Read>(reader: R) -> anyhow::Result<Vec<Stop>> {
    let mut csv_reader = csv_reader(reader);
    let mut stops = Vec::new();

    for record in csv_reader.records() {
        let record = record?;
        match parse_stop(&record) {
            Some(stop) => stops.push(stop),
            None => warn!("skipping malformed stop row: {:?}", record),
        }
    }

    Ok(stops)
}

/// Lines export: line id, plan version, short name, description.
pub fn read_lines<R: Read>(reader: R) -> anyhow::Result<Vec<Line>> {
    let mut csv_reader = csv_reader(reader);
    let mut lines = Vec::new();

    for record in csv_reader.records() {
        let record = record?;
        match parse_line(&record) {
            Some(line) => lines.push(line),
            None => warn!("skipping malformed line row: {:?}", record),
        }
    }

    Ok(lines)
}

/// Linestops export: linestop id, stop sequence, orientation, line id,
/// stop id, plan version, line variant, variant type.
pub fn read_linestops<R: Read>(reader: R) -> anyhow::Result<Vec<ConnectivityTuple>> {
    let mut csv_reader = csv_reader(reader);
    let mut tuples = Vec::new();

    for record in csv_reader.records() {
        let record = record?;
        match parse_linestop(&record) {
            Some(tuple) => tuples.push(tuple),
            None => warn!("skipping malformed linestop row: {:?}", record),
        }
    }

    Ok(tuples)
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader)
}

fn parse_stop(record: &StringRecord) -> Option<Stop> {
    Some(Stop {
        stop_id: record.get(0)?.trim().parse().ok()?,
        short_name: record.get(2)?.trim().to_string(),
        long_name: record.get(3)?.trim().to_string(),
        lon: record.get(6)?.trim().parse().ok()?,
        lat: record.get(7)?.trim().parse().ok()?,
    })
}

fn parse_line(record: &StringRecord) -> Option<Line> {
    Some(Line {
        line_id: record.get(0)?.trim().parse().ok()?,
        short_name: record.get(2)?.trim().to_string(),
        description: record.get(3)?.trim().to_string(),
    })
}

fn parse_linestop(record: &StringRecord) -> Option<ConnectivityTuple> {
    Some(ConnectivityTuple {
        stop_sequence: record.get(1)?.trim().parse().ok()?,
        orientation: record.get(2)?.trim().parse().ok()?,
        line_id: record.get(3)?.trim().parse().ok()?,
        stop_id: record.get(4)?.trim().parse().ok()?,
        line_variant: record.get(6)?.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_stops_with_decimal_coordinates() {
        let csv = "\
STOPID,PLANVERSIONID,SHORTNAME,LONGNAME,GPS_X,GPS_Y,DECIMALLONGITUDE,DECIMALLATITUDE
500300,241,A10A,Unidad Deportiva - A10A,-76532000,3400500,-76.532,3.4005
500301,241,A10B,Unidad Deportiva - A10B,-76531000,3400900,-76.531,3.4009
";
        let stops = read_stops(csv.as_bytes()).unwrap();
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0].stop_id, 500300);
        assert_eq!(stops[0].short_name, "A10A");
        assert!((stops[0].lon - (-76.532)).abs() < 1e-9);
        assert!((stops[0].lat - 3.4005).abs() < 1e-9);
    }

    #[test]
    fn skips_malformed_rows() {
        let csv = "\
STOPID,PLANVERSIONID,SHORTNAME,LONGNAME,GPS_X,GPS_Y,DECIMALLONGITUDE,DECIMALLATITUDE
not-a-number,241,A10A,Broken,-76532000,3400500,-76.532,3.4005
500301,241,A10B,Ok,-76531000,3400900,-76.531,3.4009
short,row
";
        let stops = read_stops(csv.as_bytes()).unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].stop_id, 500301);
    }

    #[test]
    fn reads_lines_and_linestops() {
        let lines_csv = "\
LINEID,PLANVERSIONID,SHORTNAME,DESCRIPTION
131,241,T31,Terminal Menga - Universidades
";
        let lines = read_lines(lines_csv.as_bytes()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line_id, 131);
        assert_eq!(lines[0].short_name, "T31");

        let linestops_csv = "\
LINESTOPID,STOPSEQUENCE,ORIENTATION,LINEID,STOPID,PLANVERSIONID,LINEVARIANT,LINEVARIANTTYPE
9001,1,0,131,500300,241,1,1
9002,2,0,131,500301,241,1,1
";
        let tuples = read_linestops(linestops_csv.as_bytes()).unwrap();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].line_id, 131);
        assert_eq!(tuples[0].stop_id, 500300);
        assert_eq!(tuples[0].stop_sequence, 1);
        assert_eq!(tuples[0].orientation, 0);
        assert_eq!(tuples[0].line_variant, 1);
    }
}
