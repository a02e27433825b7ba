//! File layer interface
//!
//! Open files and inodes are reference counted by the file layer; the
//! process core only duplicates and drops handles.

/// Handles the process core needs from the file system
pub trait FileOps {
    /// Open file handle
    type File: Send;
    /// In-memory inode handle (used for the working directory)
    type Inode: Send;

    /// Take another reference to an open file
    fn dup_file(&self, file: &Self::File) -> Self::File;

    /// Drop a reference to an open file
    fn close_file(&self, file: Self::File);

    /// Take another reference to an inode
    fn dup_inode(&self, inode: &Self::Inode) -> Self::Inode;

    /// Drop a reference to an inode. Must run inside a transaction.
    fn put_inode(&self, inode: Self::Inode);

    /// Inode of "/"
    fn root_inode(&self) -> Option<Self::Inode>;

    /// Start a file system transaction
    fn begin_op(&self);

    /// Finish a file system transaction
    fn end_op(&self);

    /// One-time file system initialization. Runs in process context
    /// because it may sleep.
    fn init_fs(&self) {}
}
