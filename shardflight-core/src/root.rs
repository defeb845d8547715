//! Schema'd batch container shared by a job (writer) and the delivery
//! handler (reader).

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::allocator::{BufferAllocator, Reservation};
use crate::error::{StreamError, StreamResult};

/// Holds at most one loaded batch of a fixed schema.
///
/// The memory of the loaded batch is reserved against the allocator and
/// given back when the batch is taken, replaced, cleared, or the root is
/// dropped.
pub struct VectorSchemaRoot {
    schema: SchemaRef,
    allocator: BufferAllocator,
    validate: bool,
    check_schema: bool,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    batch: Option<RecordBatch>,
    reservation: Option<Reservation>,
}

impl VectorSchemaRoot {
    #[must_use]
    pub fn new(schema: SchemaRef, allocator: BufferAllocator) -> Self {
        Self {
            schema,
            allocator,
            validate: false,
            check_schema: true,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Fully validate every loaded batch's array data.
    #[must_use]
    pub const fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Compare each loaded batch's fields against the stream schema.
    #[must_use]
    pub const fn with_schema_check(mut self, check: bool) -> Self {
        self.check_schema = check;
        self
    }

    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    #[must_use]
    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Replace the current contents with `batch`.
    pub fn load(&self, batch: RecordBatch) -> StreamResult<()> {
        if self.check_schema && batch.schema().fields() != self.schema.fields() {
            return Err(StreamError::Internal(format!(
                "batch schema does not match stream schema: {:?} vs {:?}",
                batch.schema().fields(),
                self.schema.fields()
            )));
        }
        if self.validate {
            for column in batch.columns() {
                column.to_data().validate_full()?;
            }
        }

        let reservation = self.allocator.reserve(batch.get_array_memory_size())?;
        let mut slot = self.slot.lock();
        // Assigning drops the previous reservation.
        slot.reservation = Some(reservation);
        slot.batch = Some(batch);
        Ok(())
    }

    /// Move the loaded batch out, releasing its reservation.
    pub fn take(&self) -> Option<RecordBatch> {
        let mut slot = self.slot.lock();
        slot.reservation = None;
        slot.batch.take()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.slot.lock().batch.as_ref().map_or(0, RecordBatch::num_rows)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.slot.lock().batch.is_some()
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock();
        slot.batch = None;
        slot.reservation = None;
    }
}

impl std::fmt::Debug for VectorSchemaRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorSchemaRoot")
            .field("fields", &self.schema.fields().len())
            .field("rows", &self.row_count())
            .field("allocator", &self.allocator.name())
            .finish()
    }
}
