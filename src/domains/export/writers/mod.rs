pub mod csv_writer;
pub mod xlsx_writer;

pub use csv_writer::StreamingCsvWriter;
pub use xlsx_writer::StreamingXlsxWriter;
